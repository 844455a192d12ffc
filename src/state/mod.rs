//! Per-block projections of chain state.
//!
//! Both projections are plain values: a block carries full snapshots of them
//! in its header and the blockchain replaces its live copies wholesale when a
//! block is accepted.

pub mod account_state;
pub mod keeper;

pub use account_state::AccountStateModel;
pub use keeper::BeezKeeper;

use crate::errors::ChainResult;
use crate::types::PooledTransaction;

/// Applies `transactions` in order to copies of the given projections.
///
/// Fails on the first transaction that cannot be applied; the inputs are left
/// untouched either way.
pub fn apply_transactions(
    accounts: &AccountStateModel,
    keeper: &BeezKeeper,
    transactions: &[PooledTransaction],
) -> ChainResult<(AccountStateModel, BeezKeeper)> {
    let mut accounts = accounts.clone();
    let mut keeper = keeper.clone();
    for tx in transactions {
        apply_transaction(&mut accounts, &mut keeper, tx)?;
    }
    Ok((accounts, keeper))
}

pub fn apply_transaction(
    accounts: &mut AccountStateModel,
    keeper: &mut BeezKeeper,
    tx: &PooledTransaction,
) -> ChainResult<()> {
    match tx {
        PooledTransaction::Transfer(tx) => accounts.apply(tx),
        PooledTransaction::Challenge(challenge_tx) => {
            keeper.ensure_unknown(&challenge_tx.challenge.id)?;
            accounts.escrow(
                &challenge_tx.sender_public_key,
                challenge_tx.challenge.reward,
            )?;
            keeper.open(challenge_tx.challenge.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Wallet;
    use crate::types::{Challenge, ChallengeTx, Stake, Transaction, TransactionType};

    #[test]
    fn failed_batch_leaves_inputs_untouched() {
        let wallet = Wallet::generate();
        let sender = wallet.public_key_string();
        let accounts = AccountStateModel::from_accounts(vec![crate::types::Account::new(
            sender.clone(),
            10,
            Stake::zero(),
        )]);
        let keeper = BeezKeeper::default();

        let ok = Transaction::new(sender.clone(), "r".into(), 6, TransactionType::Transfer);
        let overdraw = Transaction::new(sender.clone(), "r".into(), 6, TransactionType::Transfer);
        let result = apply_transactions(&accounts, &keeper, &[ok.into(), overdraw.into()]);
        assert!(result.is_err());
        assert_eq!(accounts.balance(&sender), 10);
    }

    #[test]
    fn challenge_escrows_reward_and_registers() {
        let wallet = Wallet::generate();
        let sender = wallet.public_key_string();
        let accounts = AccountStateModel::from_accounts(vec![crate::types::Account::new(
            sender.clone(),
            50,
            Stake::zero(),
        )]);
        let challenge = Challenge::new(sender.clone(), vec![], 20);
        let challenge_id = challenge.id.clone();
        let tx = ChallengeTx::new(sender.clone(), challenge);

        let (accounts, keeper) =
            apply_transactions(&accounts, &BeezKeeper::default(), &[tx.clone().into()])
                .expect("challenge applies");
        assert_eq!(accounts.balance(&sender), 30);
        assert!(keeper.challenge(&challenge_id).is_some());

        assert!(apply_transactions(&accounts, &keeper, &[tx.into()]).is_err());
    }
}
