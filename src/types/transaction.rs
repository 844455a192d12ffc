use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::Wallet;
use crate::errors::ChainResult;

use super::challenge::ChallengeTx;
use super::Address;

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Transfer,
    Exchange,
    Stake,
    UploadAsset,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub sender_public_key: Address,
    pub receiver: Address,
    pub amount: u128,
    pub tx_type: TransactionType,
    pub timestamp: u64,
    pub signature: String,
}

impl Transaction {
    pub fn new(
        sender_public_key: Address,
        receiver: Address,
        amount: u128,
        tx_type: TransactionType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_public_key,
            receiver,
            amount,
            tx_type,
            timestamp: unix_timestamp(),
            signature: String::new(),
        }
    }

    /// Canonical bytes covered by the signature: the transaction with an
    /// empty signature field.
    pub fn payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = String::new();
        serde_json::to_vec(&unsigned).expect("serializing transaction payload")
    }

    pub fn sign(&mut self, wallet: &Wallet) {
        self.signature = wallet.sign(&self.payload());
    }

    pub fn verify(&self) -> ChainResult<()> {
        Wallet::verify(&self.payload(), &self.signature, &self.sender_public_key)
    }
}

/// Everything the pool and blocks carry: plain transactions and challenge
/// transactions share admission, dedup and signature rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PooledTransaction {
    Transfer(Transaction),
    Challenge(ChallengeTx),
}

impl PooledTransaction {
    pub fn id(&self) -> &str {
        match self {
            PooledTransaction::Transfer(tx) => &tx.id,
            PooledTransaction::Challenge(tx) => &tx.id,
        }
    }

    pub fn sender_public_key(&self) -> &str {
        match self {
            PooledTransaction::Transfer(tx) => &tx.sender_public_key,
            PooledTransaction::Challenge(tx) => &tx.sender_public_key,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            PooledTransaction::Transfer(tx) => tx.payload(),
            PooledTransaction::Challenge(tx) => tx.payload(),
        }
    }

    pub fn signature(&self) -> &str {
        match self {
            PooledTransaction::Transfer(tx) => &tx.signature,
            PooledTransaction::Challenge(tx) => &tx.signature,
        }
    }

    pub fn signature_valid(&self) -> bool {
        Wallet::signature_valid(&self.payload(), self.signature(), self.sender_public_key())
    }
}

impl From<Transaction> for PooledTransaction {
    fn from(tx: Transaction) -> Self {
        PooledTransaction::Transfer(tx)
    }
}

impl From<ChallengeTx> for PooledTransaction {
    fn from(tx: ChallengeTx) -> Self {
        PooledTransaction::Challenge(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_excludes_signature() {
        let wallet = Wallet::generate();
        let mut tx = Transaction::new(
            wallet.public_key_string(),
            "receiver".into(),
            10,
            TransactionType::Transfer,
        );
        let unsigned = tx.payload();
        tx.sign(&wallet);
        assert_eq!(unsigned, tx.payload());
        tx.verify().expect("signature verifies");
    }

    #[test]
    fn tampered_amount_fails_verification() {
        let wallet = Wallet::generate();
        let mut tx = Transaction::new(
            wallet.public_key_string(),
            "receiver".into(),
            10,
            TransactionType::Transfer,
        );
        tx.sign(&wallet);
        tx.amount = 11;
        assert!(tx.verify().is_err());
        assert!(!PooledTransaction::from(tx).signature_valid());
    }

    #[test]
    fn transaction_type_uses_wire_names() {
        let encoded = serde_json::to_string(&TransactionType::UploadAsset).expect("encode");
        assert_eq!(encoded, "\"UPLOAD_ASSET\"");
    }
}
