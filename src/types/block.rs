use serde::{Deserialize, Serialize};

use crate::crypto::{hash_bytes, hash_hex, Wallet};
use crate::state::{AccountStateModel, BeezKeeper};

use super::transaction::PooledTransaction;
use super::Address;

pub const GENESIS_FORGER: &str = "genesis";

/// Binary merkle root over the transaction ids, in block order.
///
/// An odd node is paired with itself; an empty block hashes a fixed domain tag.
pub fn compute_merkle_root(leaves: &mut Vec<[u8; 32]>) -> [u8; 32] {
    if leaves.is_empty() {
        return hash_bytes(b"beez-empty");
    }
    while leaves.len() > 1 {
        let mut next = Vec::with_capacity((leaves.len() + 1) / 2);
        for chunk in leaves.chunks(2) {
            let left = chunk[0];
            let right = if chunk.len() == 2 { chunk[1] } else { chunk[0] };
            let mut data = Vec::with_capacity(64);
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            next.push(hash_bytes(&data));
        }
        *leaves = next;
    }
    leaves[0]
}

pub fn transaction_root(transactions: &[PooledTransaction]) -> String {
    let mut leaves: Vec<[u8; 32]> = transactions
        .iter()
        .map(|tx| hash_bytes(tx.id().as_bytes()))
        .collect();
    hex::encode(compute_merkle_root(&mut leaves))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous_hash: String,
    pub height: u64,
    pub forger: Address,
    pub tx_root: String,
    pub account_state_model: AccountStateModel,
    pub beez_keeper: BeezKeeper,
    pub timestamp: u64,
}

impl BlockHeader {
    pub fn payload(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("serializing block header")
    }

    pub fn hash(&self) -> String {
        hash_hex(&self.payload())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<PooledTransaction>,
    pub signature: String,
}

impl Block {
    /// The first block of every chain. Only depends on the chain id and the
    /// genesis state, so every node configured with the same genesis table
    /// derives the same hash.
    pub fn genesis(chain_id: &str, account_state_model: AccountStateModel) -> Self {
        let header = BlockHeader {
            previous_hash: hash_hex(chain_id.as_bytes()),
            height: 0,
            forger: GENESIS_FORGER.to_string(),
            tx_root: transaction_root(&[]),
            account_state_model,
            beez_keeper: BeezKeeper::default(),
            timestamp: 0,
        };
        Self {
            header,
            transactions: Vec::new(),
            signature: String::new(),
        }
    }

    pub fn new(header: BlockHeader, transactions: Vec<PooledTransaction>, wallet: &Wallet) -> Self {
        let signature = wallet.sign(&header.payload());
        Self {
            header,
            transactions,
            signature,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        self.header.payload()
    }

    pub fn hash(&self) -> String {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn forger(&self) -> &str {
        &self.header.forger
    }

    pub fn signature_valid(&self) -> bool {
        Wallet::signature_valid(&self.payload(), &self.signature, &self.header.forger)
    }

    pub fn tx_root_valid(&self) -> bool {
        self.header.tx_root == transaction_root(&self.transactions)
    }

    pub fn contains(&self, tx_id: &str) -> bool {
        self.transactions.iter().any(|tx| tx.id() == tx_id)
    }
}
