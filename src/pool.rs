use std::collections::{HashSet, VecDeque};

use crate::errors::{ChainError, ChainResult};
use crate::types::PooledTransaction;

/// Pending transactions and challenges in arrival order.
#[derive(Debug, Clone)]
pub struct TransactionPool {
    queue: VecDeque<PooledTransaction>,
    ids: HashSet<String>,
    limit: usize,
}

impl TransactionPool {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            ids: HashSet::new(),
            limit,
        }
    }

    /// Inserts `tx` unless its id is already pending. Returns whether it was
    /// added.
    pub fn add(&mut self, tx: PooledTransaction) -> ChainResult<bool> {
        if self.ids.contains(tx.id()) {
            return Ok(false);
        }
        if self.queue.len() >= self.limit {
            return Err(ChainError::Transaction("mempool full".into()));
        }
        self.ids.insert(tx.id().to_string());
        self.queue.push_back(tx);
        Ok(true)
    }

    pub fn exists(&self, tx_id: &str) -> bool {
        self.ids.contains(tx_id)
    }

    pub fn forging_required(&self, threshold: usize) -> bool {
        self.queue.len() >= threshold.max(1)
    }

    /// Evicts the given transactions; absent ids are ignored.
    pub fn remove<'a, I>(&mut self, transactions: I)
    where
        I: IntoIterator<Item = &'a PooledTransaction>,
    {
        let evicted: HashSet<&str> = transactions.into_iter().map(|tx| tx.id()).collect();
        if evicted.is_empty() {
            return;
        }
        self.queue.retain(|tx| !evicted.contains(tx.id()));
        self.ids.retain(|id| !evicted.contains(id.as_str()));
    }

    pub fn transactions(&self) -> Vec<PooledTransaction> {
        self.queue.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
