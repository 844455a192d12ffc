use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::config::GenesisConfig;
use crate::consensus::select_forger;
use crate::crypto::Wallet;
use crate::errors::{ChainError, ChainResult};
use crate::state::{apply_transaction, apply_transactions, AccountStateModel, BeezKeeper};
use crate::types::{
    transaction_root, unix_timestamp, Account, Address, Block, BlockHeader, PooledTransaction,
};

/// The local replica of the chain together with the live state projections
/// of its tip.
#[derive(Clone, Debug)]
pub struct Blockchain {
    blocks: Vec<Block>,
    account_state_model: AccountStateModel,
    beez_keeper: BeezKeeper,
}

impl Blockchain {
    pub fn new(genesis: Block) -> Self {
        let account_state_model = genesis.header.account_state_model.clone();
        let beez_keeper = genesis.header.beez_keeper.clone();
        Self {
            blocks: vec![genesis],
            account_state_model,
            beez_keeper,
        }
    }

    pub fn from_genesis(config: &GenesisConfig) -> ChainResult<Self> {
        let mut accounts = Vec::with_capacity(config.accounts.len());
        for entry in &config.accounts {
            accounts.push(Account::new(
                entry.public_key.clone(),
                entry.balance,
                entry.stake_value()?,
            ));
        }
        let state = AccountStateModel::from_accounts(accounts);
        Ok(Self::new(Block::genesis(&config.chain_id, state)))
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn tip(&self) -> &Block {
        // The genesis block is never removed.
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn height(&self) -> u64 {
        self.tip().height()
    }

    pub fn account_state_model(&self) -> &AccountStateModel {
        &self.account_state_model
    }

    pub fn beez_keeper(&self) -> &BeezKeeper {
        &self.beez_keeper
    }

    /// Challenge transitions are gossiped outside of blocks and only touch
    /// the live projection.
    pub fn beez_keeper_mut(&mut self) -> &mut BeezKeeper {
        &mut self.beez_keeper
    }

    /// Keeper as committed by the tip. Blocks are built and checked against
    /// this one so that gossiped transitions never split consensus.
    pub fn committed_keeper(&self) -> &BeezKeeper {
        &self.tip().header.beez_keeper
    }

    /// Forger of the block that would extend the current tip.
    pub fn next_forger(&self) -> Option<Address> {
        let stakers = self.account_state_model.stakers();
        let height = self.height() + 1;
        select_forger(&stakers, &self.tip().hash(), height).map(|selection| selection.forger)
    }

    pub fn blockcount_valid(&self, block: &Block) -> bool {
        block.height() == self.blocks.len() as u64
    }

    pub fn last_blockhash_valid(&self, block: &Block) -> bool {
        block.header.previous_hash == self.tip().hash()
    }

    pub fn forger_valid(&self, block: &Block) -> bool {
        self.next_forger().as_deref() == Some(block.forger())
    }

    pub fn signature_valid(&self, block: &Block) -> bool {
        block.signature_valid()
    }

    /// Every transaction is signed by its sender, appears once, has not been
    /// committed before and applies cleanly on top of the tip state.
    pub fn transaction_valid(&self, transactions: &[PooledTransaction]) -> bool {
        let mut seen = HashSet::new();
        for tx in transactions {
            if !tx.signature_valid() {
                debug!(tx_id = %tx.id(), "transaction signature invalid");
                return false;
            }
            if !seen.insert(tx.id()) || self.transaction_exist(tx.id()) {
                debug!(tx_id = %tx.id(), "transaction replayed");
                return false;
            }
        }
        let keeper = self.committed_keeper();
        match apply_transactions(&self.account_state_model, keeper, transactions) {
            Ok(_) => true,
            Err(err) => {
                debug!(?err, "transactions do not apply to the tip state");
                false
            }
        }
    }

    /// The header snapshots are exactly what applying the block yields.
    pub fn state_valid(&self, block: &Block) -> bool {
        if !block.tx_root_valid() {
            return false;
        }
        match apply_transactions(
            &self.account_state_model,
            self.committed_keeper(),
            &block.transactions,
        ) {
            Ok((accounts, keeper)) => {
                accounts == block.header.account_state_model && keeper == block.header.beez_keeper
            }
            Err(_) => false,
        }
    }

    pub fn validate(&self, block: &Block) -> ChainResult<()> {
        if !self.blockcount_valid(block) {
            return Err(ChainError::Block(format!(
                "unexpected height {} (expected {})",
                block.height(),
                self.blocks.len()
            )));
        }
        if !self.last_blockhash_valid(block) {
            return Err(ChainError::Block("previous hash does not match tip".into()));
        }
        if !self.forger_valid(block) {
            return Err(ChainError::Block(format!(
                "{} is not the elected forger",
                block.forger()
            )));
        }
        if !self.signature_valid(block) {
            return Err(ChainError::Block("invalid forger signature".into()));
        }
        if !self.transaction_valid(&block.transactions) {
            return Err(ChainError::Block("block carries invalid transactions".into()));
        }
        if !self.state_valid(block) {
            return Err(ChainError::Block("state snapshot mismatch".into()));
        }
        Ok(())
    }

    /// True when `block` is the very block already held at its height.
    pub fn is_known(&self, block: &Block) -> bool {
        usize::try_from(block.height())
            .ok()
            .and_then(|height| self.blocks.get(height))
            .map_or(false, |held| held == block)
    }

    /// Builds and signs the next block out of `transactions`.
    ///
    /// Transactions that fail their signature, were already committed or no
    /// longer apply on top of the previous ones are left out; at most `limit`
    /// are included.
    pub fn mint_block(
        &self,
        transactions: &[PooledTransaction],
        wallet: &Wallet,
        limit: usize,
    ) -> ChainResult<Block> {
        let forger = wallet.public_key_string();
        if self.next_forger().as_deref() != Some(forger.as_str()) {
            return Err(ChainError::Block(format!(
                "{forger} is not the elected forger"
            )));
        }
        let mut accounts = self.account_state_model.clone();
        let mut keeper = self.committed_keeper().clone();
        let mut included: Vec<PooledTransaction> = Vec::new();
        for tx in transactions {
            if included.len() >= limit {
                break;
            }
            if !tx.signature_valid()
                || self.transaction_exist(tx.id())
                || included.iter().any(|other| other.id() == tx.id())
            {
                continue;
            }
            let mut next_accounts = accounts.clone();
            let mut next_keeper = keeper.clone();
            match apply_transaction(&mut next_accounts, &mut next_keeper, tx) {
                Ok(()) => {
                    accounts = next_accounts;
                    keeper = next_keeper;
                    included.push(tx.clone());
                }
                Err(err) => debug!(tx_id = %tx.id(), ?err, "skipping transaction while minting"),
            }
        }
        let header = BlockHeader {
            previous_hash: self.tip().hash(),
            height: self.height() + 1,
            forger,
            tx_root: transaction_root(&included),
            account_state_model: accounts,
            beez_keeper: keeper,
            timestamp: unix_timestamp(),
        };
        Ok(Block::new(header, included, wallet))
    }

    /// Validates `block` against the tip and commits it, replacing the live
    /// projections with the block's snapshots.
    pub fn add_block(&mut self, block: Block) -> ChainResult<()> {
        self.validate(&block)?;
        self.commit(block);
        Ok(())
    }

    /// Sync-path append. Blocks taken from a peer's chain pass the same
    /// checks as blocks received one by one.
    pub fn append_block(&mut self, block: Block) -> ChainResult<()> {
        self.add_block(block)
    }

    /// Replaces the live projections with the block's snapshots. Gossiped
    /// challenge transitions that are ahead of the snapshot are kept.
    fn commit(&mut self, block: Block) {
        self.account_state_model = block.header.account_state_model.clone();
        let mut keeper = block.header.beez_keeper.clone();
        for challenge in self.beez_keeper.challenges() {
            keeper.apply_update(challenge);
        }
        self.beez_keeper = keeper;
        info!(
            height = block.height(),
            forger = %block.forger(),
            transactions = block.transactions.len(),
            "block committed"
        );
        self.blocks.push(block);
    }

    /// Appends the suffix of a longer (or equally long) peer chain.
    ///
    /// Never removes local blocks. Returns the blocks actually appended; a
    /// block that fails validation stops the merge.
    pub fn merge(&mut self, chain: Vec<Block>) -> Vec<Block> {
        let local = self.blocks.len();
        if chain.len() < local {
            debug!(local, received = chain.len(), "ignoring shorter chain");
            return Vec::new();
        }
        let mut appended = Vec::new();
        for block in chain.into_iter().skip(local) {
            let height = block.height();
            match self.append_block(block.clone()) {
                Ok(()) => appended.push(block),
                Err(err) => {
                    warn!(height, ?err, "stopping chain merge at invalid block");
                    break;
                }
            }
        }
        appended
    }

    pub fn transaction_exist(&self, tx_id: &str) -> bool {
        self.blocks.iter().any(|block| block.contains(tx_id))
    }
}
