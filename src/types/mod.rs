mod account;
mod block;
mod challenge;
mod transaction;

pub use account::{Account, Stake};
pub use block::{compute_merkle_root, transaction_root, Block, BlockHeader, GENESIS_FORGER};
pub use challenge::{Challenge, ChallengeState, ChallengeTx};
pub(crate) use transaction::unix_timestamp;
pub use transaction::{PooledTransaction, Transaction, TransactionType};

pub type Address = String;
