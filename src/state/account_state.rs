use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Account, Address, Stake, Transaction, TransactionType};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStateModel {
    accounts: BTreeMap<Address, Account>,
}

impl AccountStateModel {
    pub fn from_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|account| (account.public_key.clone(), account))
                .collect(),
        }
    }

    pub fn get(&self, public_key: &str) -> Option<&Account> {
        self.accounts.get(public_key)
    }

    pub fn balance(&self, public_key: &str) -> u128 {
        self.accounts
            .get(public_key)
            .map(|account| account.balance)
            .unwrap_or(0)
    }

    pub fn stake(&self, public_key: &str) -> Stake {
        self.accounts
            .get(public_key)
            .map(|account| account.stake.clone())
            .unwrap_or_default()
    }

    pub fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.accounts.values()
    }

    /// Accounts with non-zero stake, ordered by public key.
    pub fn stakers(&self) -> Vec<(Address, Stake)> {
        self.accounts
            .values()
            .filter(|account| !account.stake.is_zero())
            .map(|account| (account.public_key.clone(), account.stake.clone()))
            .collect()
    }

    fn account_mut(&mut self, public_key: &str) -> &mut Account {
        self.accounts
            .entry(public_key.to_string())
            .or_insert_with(|| Account::new(public_key.to_string(), 0, Stake::zero()))
    }

    /// Debits (or bonds) `amount` from the sender and bumps its nonce.
    fn charge(&mut self, public_key: &str, amount: u128, bond: bool) -> ChainResult<()> {
        let sender = self.accounts.get_mut(public_key).ok_or_else(|| {
            ChainError::Transaction(format!("unknown sender {public_key}"))
        })?;
        let charged = if bond {
            sender.bond(amount)
        } else {
            sender.debit(amount)
        };
        if !charged {
            return Err(ChainError::Transaction(format!(
                "insufficient balance for {public_key}: {} < {amount}",
                sender.balance
            )));
        }
        sender.nonce = sender.nonce.saturating_add(1);
        Ok(())
    }

    pub(crate) fn escrow(&mut self, public_key: &str, amount: u128) -> ChainResult<()> {
        self.charge(public_key, amount, false)
    }

    pub fn apply(&mut self, tx: &Transaction) -> ChainResult<()> {
        match tx.tx_type {
            TransactionType::Stake => self.charge(&tx.sender_public_key, tx.amount, true)?,
            TransactionType::Transfer | TransactionType::Exchange | TransactionType::UploadAsset => {
                self.charge(&tx.sender_public_key, tx.amount, false)?;
                self.account_mut(&tx.receiver).credit(tx.amount);
            }
        }
        Ok(())
    }
}
