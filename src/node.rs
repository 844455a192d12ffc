use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::blockchain::Blockchain;
use crate::chunks::{split_asset, AssetManifest, AssetStore, Chunk, PendingChunks};
use crate::config::{GenesisAccount, GenesisConfig, NodeConfig};
use crate::crypto::Wallet;
use crate::dispatch::MessageDispatcher;
use crate::errors::{ChainError, ChainResult};
use crate::pool::TransactionPool;
use crate::protocol::{Connector, Message, MessageBody};
use crate::state::{AccountStateModel, BeezKeeper};
use crate::transport::PeerTransport;
use crate::types::{
    Address, Block, Challenge, ChallengeState, ChallengeTx, PooledTransaction, Transaction,
    TransactionType,
};
use crate::worker::{ChunkAck, ChunkAckWorker};

const DEFAULT_GENESIS_BALANCE: u128 = 1_000_000_000;
const DEFAULT_GENESIS_STAKE: &str = "1000";

/// Blockchain and pool share one lock so that admission, forging and block
/// acceptance are atomic with respect to each other.
struct ChainState {
    blockchain: Blockchain,
    pool: TransactionPool,
}

pub struct Node {
    inner: Arc<NodeInner>,
    ack_worker: Mutex<Option<ChunkAckWorker>>,
}

struct NodeInner {
    config: NodeConfig,
    wallet: Wallet,
    transport: Arc<dyn PeerTransport>,
    state: Mutex<ChainState>,
    pending_chunks: Arc<PendingChunks>,
    assets: AssetStore,
    acks: tokio::sync::mpsc::UnboundedSender<ChunkAck>,
    pulls: Mutex<HashMap<String, oneshot::Sender<Option<Vec<u8>>>>>,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        wallet: Wallet,
        transport: Arc<dyn PeerTransport>,
    ) -> ChainResult<Self> {
        config.validate()?;
        let assets = AssetStore::open(&config.asset_dir)?;
        let genesis = if config.genesis.accounts.is_empty() {
            GenesisConfig {
                chain_id: config.genesis.chain_id.clone(),
                accounts: vec![GenesisAccount {
                    public_key: wallet.public_key_string(),
                    balance: DEFAULT_GENESIS_BALANCE,
                    stake: DEFAULT_GENESIS_STAKE.to_string(),
                }],
            }
        } else {
            config.genesis.clone()
        };
        let blockchain = Blockchain::from_genesis(&genesis)?;
        info!(
            genesis = %blockchain.tip().hash(),
            public_key = %wallet.public_key_string(),
            "node initialised"
        );
        let pool = TransactionPool::new(config.mempool_limit);
        let pending_chunks = Arc::new(PendingChunks::new());
        let (acks, ack_worker) = ChunkAckWorker::new(pending_chunks.clone());
        let inner = Arc::new(NodeInner {
            config,
            wallet,
            transport,
            state: Mutex::new(ChainState { blockchain, pool }),
            pending_chunks,
            assets,
            acks,
            pulls: Mutex::new(HashMap::new()),
        });
        Ok(Self {
            inner,
            ack_worker: Mutex::new(Some(ack_worker)),
        })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    pub fn dispatcher(&self) -> Arc<MessageDispatcher> {
        Arc::new(MessageDispatcher::new(self.handle()))
    }

    /// Starts the chunk acknowledgement worker. Only the first call spawns.
    pub fn spawn_ack_worker(&self) -> Option<JoinHandle<()>> {
        self.ack_worker.lock().take().map(ChunkAckWorker::spawn)
    }

    /// Runs the node: acknowledgement worker, neighbor dial and the peer
    /// discovery loop.
    pub async fn start(self) -> ChainResult<()> {
        self.spawn_ack_worker();
        let inner = self.inner.clone();
        if let Some(neighbor) = inner.transport.neighbor() {
            info!(%neighbor, "connecting to neighbor");
            inner.transport.connect(neighbor);
        }
        inner.run_discovery().await;
        Ok(())
    }
}

impl NodeHandle {
    pub fn public_key(&self) -> String {
        self.inner.wallet.public_key_string()
    }

    pub fn address(&self) -> String {
        self.inner.wallet.address()
    }

    pub fn connector(&self) -> Connector {
        self.inner.transport.local().clone()
    }

    pub fn submit_transaction(&self, tx: Transaction) {
        self.handle_transaction(tx)
    }

    pub fn submit_challenge(&self, challenge_tx: ChallengeTx) {
        self.handle_challenge_tx(challenge_tx)
    }

    pub fn handle_transaction(&self, tx: Transaction) {
        self.inner.handle_pooled(PooledTransaction::Transfer(tx));
    }

    pub fn handle_challenge_tx(&self, challenge_tx: ChallengeTx) {
        self.inner
            .handle_pooled(PooledTransaction::Challenge(challenge_tx));
    }

    pub fn handle_challenge_update(&self, challenge: Challenge) {
        self.inner.handle_challenge_update(challenge)
    }

    /// Moves a known challenge forward and gossips the transition.
    pub fn update_challenge(
        &self,
        challenge_id: &str,
        next: ChallengeState,
    ) -> ChainResult<Challenge> {
        self.inner.update_challenge(challenge_id, next)
    }

    pub fn handle_block(&self, block: Block) {
        self.inner.handle_block(block)
    }

    pub fn request_chain(&self) {
        self.inner.request_chain()
    }

    pub fn handle_blockchain_request(&self, requester: &Connector) {
        self.inner.handle_blockchain_request(requester)
    }

    pub fn handle_blockchain(&self, blocks: Vec<Block>) {
        self.inner.handle_blockchain(blocks)
    }

    pub fn handle_available_peers(&self, peers: &BTreeMap<String, u16>) {
        self.inner.handle_available_peers(peers)
    }

    pub fn handle_chunk_push(
        &self,
        from: &Connector,
        chunk_id: &str,
        file_name: &str,
        data: &[u8],
    ) {
        self.inner.handle_chunk_push(from, chunk_id, file_name, data)
    }

    pub fn enqueue_chunk_ack(&self, ack: ChunkAck) {
        if self.inner.acks.send(ack).is_err() {
            warn!("chunk acknowledgement worker stopped");
        }
    }

    pub fn handle_chunk_pull(&self, from: &Connector, chunk_id: &str, file_name: &str) {
        self.inner.handle_chunk_pull(from, chunk_id, file_name)
    }

    pub fn handle_chunk_pull_reply(&self, chunk_id: &str, data: Option<Vec<u8>>) {
        self.inner.handle_chunk_pull_reply(chunk_id, data)
    }

    pub fn forge(&self) {
        self.inner.forge()
    }

    /// Pushes `content` to storage peers and, once every chunk is
    /// acknowledged, submits `tx` to the network. Returns the asset hash.
    pub async fn upload_asset(
        &self,
        file_name: &str,
        content: &[u8],
        tx: Transaction,
    ) -> ChainResult<String> {
        self.inner.clone().upload_asset(file_name, content, tx).await
    }

    pub async fn download_asset(&self, file_name: &str) -> ChainResult<Vec<u8>> {
        self.inner.clone().download_asset(file_name).await
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.inner.state.lock().blockchain.blocks().to_vec()
    }

    pub fn block_count(&self) -> usize {
        self.inner.state.lock().blockchain.block_count()
    }

    pub fn tip(&self) -> Block {
        self.inner.state.lock().blockchain.tip().clone()
    }

    pub fn next_forger(&self) -> Option<Address> {
        self.inner.state.lock().blockchain.next_forger()
    }

    pub fn pool_transactions(&self) -> Vec<PooledTransaction> {
        self.inner.state.lock().pool.transactions()
    }

    /// Chain and pool as seen at one instant.
    pub fn chain_snapshot(&self) -> (Vec<Block>, Vec<PooledTransaction>) {
        let state = self.inner.state.lock();
        (state.blockchain.blocks().to_vec(), state.pool.transactions())
    }

    pub fn account_state_model(&self) -> AccountStateModel {
        self.inner
            .state
            .lock()
            .blockchain
            .account_state_model()
            .clone()
    }

    pub fn beez_keeper(&self) -> BeezKeeper {
        self.inner.state.lock().blockchain.beez_keeper().clone()
    }

    pub fn pending_chunks(&self) -> Arc<PendingChunks> {
        self.inner.pending_chunks.clone()
    }

    /// Connected peers, with the configured neighbor listed even while it is
    /// not connected.
    pub fn connected_nodes(&self) -> Vec<Connector> {
        let mut nodes = self.inner.transport.own_connections();
        if let Some(neighbor) = self.inner.transport.neighbor() {
            if !nodes.contains(&neighbor) {
                nodes.push(neighbor);
            }
        }
        nodes.sort();
        nodes
    }
}

impl NodeInner {
    fn message(&self, body: MessageBody) -> Message {
        Message::new(self.transport.local().clone(), body)
    }

    fn broadcast(&self, body: MessageBody) {
        match self.message(body).encode() {
            Ok(frame) => self.transport.broadcast(frame),
            Err(err) => warn!(?err, "failed to encode broadcast"),
        }
    }

    fn send(&self, target: &Connector, body: MessageBody) -> ChainResult<()> {
        let frame = self.message(body).encode()?;
        self.transport.send(target, frame)
    }

    /// Admits `tx` to the pool, gossips it and forges when the pool asks
    /// for it. Returns whether the transaction was admitted.
    fn handle_pooled(&self, tx: PooledTransaction) -> bool {
        let forging_required = {
            let mut state = self.state.lock();
            if !tx.signature_valid() {
                debug!(tx_id = %tx.id(), "dropping transaction with invalid signature");
                return false;
            }
            if let Err(err) = Self::ensure_unknown(&state, tx.id()) {
                debug!(?err, "dropping known transaction");
                return false;
            }
            if let Err(err) = state.pool.add(tx.clone()) {
                warn!(tx_id = %tx.id(), ?err, "dropping transaction");
                return false;
            }
            state.pool.forging_required(self.config.forging_threshold)
        };
        info!(tx_id = %tx.id(), "transaction admitted to pool");
        let body = match tx {
            PooledTransaction::Transfer(tx) => MessageBody::Transaction(tx),
            PooledTransaction::Challenge(tx) => MessageBody::Challenge(tx),
        };
        self.broadcast(body);
        if forging_required {
            self.forge();
        }
        true
    }

    fn ensure_unknown(state: &ChainState, tx_id: &str) -> ChainResult<()> {
        if state.pool.exists(tx_id) {
            return Err(ChainError::Transaction(format!("{tx_id} is already pending")));
        }
        if state.blockchain.transaction_exist(tx_id) {
            return Err(ChainError::Transaction(format!("{tx_id} is already committed")));
        }
        Ok(())
    }

    fn forge(&self) {
        let block = {
            let mut state = self.state.lock();
            let me = self.wallet.public_key_string();
            match state.blockchain.next_forger() {
                Some(forger) if forger == me => {}
                forger => {
                    debug!(?forger, "not the next forger");
                    return;
                }
            }
            let candidates = state.pool.transactions();
            let block = match state.blockchain.mint_block(
                &candidates,
                &self.wallet,
                self.config.max_block_transactions,
            ) {
                Ok(block) => block,
                Err(err) => {
                    warn!(?err, "minting failed");
                    return;
                }
            };
            if block.transactions.is_empty() {
                debug!("no applicable transactions to forge");
                return;
            }
            if let Err(err) = state.blockchain.add_block(block.clone()) {
                warn!(?err, "own block rejected");
                return;
            }
            state.pool.remove(&block.transactions);
            block
        };
        info!(height = block.height(), "forged block");
        self.broadcast(MessageBody::Block(block));
    }

    fn handle_block(&self, block: Block) {
        let height = block.height();
        let sync_required = {
            let mut state = self.state.lock();
            if state.blockchain.is_known(&block) {
                debug!(height, "ignoring known block");
                return;
            }
            if state.blockchain.blockcount_valid(&block) {
                if let Err(err) = state.blockchain.add_block(block.clone()) {
                    warn!(height, ?err, "dropping invalid block");
                    return;
                }
                state.pool.remove(&block.transactions);
                false
            } else {
                info!(
                    height,
                    local = state.blockchain.block_count(),
                    "block height mismatch, requesting chain"
                );
                true
            }
        };
        if sync_required {
            self.request_chain();
        } else {
            self.broadcast(MessageBody::Block(block));
        }
    }

    fn request_chain(&self) {
        self.broadcast(MessageBody::BlockchainRequest);
    }

    fn handle_blockchain_request(&self, requester: &Connector) {
        let blocks = self.state.lock().blockchain.blocks().to_vec();
        if let Err(err) = self.send(requester, MessageBody::Blockchain(blocks)) {
            warn!(peer = %requester, ?err, "failed to answer chain request");
        }
    }

    fn handle_blockchain(&self, blocks: Vec<Block>) {
        let mut state = self.state.lock();
        let received = blocks.len();
        let appended = state.blockchain.merge(blocks);
        for block in &appended {
            state.pool.remove(&block.transactions);
        }
        if !appended.is_empty() {
            info!(
                received,
                appended = appended.len(),
                height = state.blockchain.height(),
                "chain synchronised"
            );
        }
    }

    fn handle_challenge_update(&self, challenge: Challenge) {
        let applied = self
            .state
            .lock()
            .blockchain
            .beez_keeper_mut()
            .apply_update(&challenge);
        if applied {
            info!(challenge_id = %challenge.id, state = ?challenge.state, "challenge updated");
            self.broadcast(MessageBody::ChallengeUpdate(challenge));
        } else {
            debug!(challenge_id = %challenge.id, "dropping stale challenge update");
        }
    }

    fn update_challenge(
        &self,
        challenge_id: &str,
        next: ChallengeState,
    ) -> ChainResult<Challenge> {
        let updated = {
            let mut state = self.state.lock();
            let keeper = state.blockchain.beez_keeper_mut();
            let current = keeper.challenge(challenge_id).cloned().ok_or_else(|| {
                ChainError::Transaction(format!("unknown challenge {challenge_id}"))
            })?;
            let updated = current.with_state(next);
            if !keeper.apply_update(&updated) {
                return Err(ChainError::Transaction(format!(
                    "challenge {challenge_id} cannot move from {:?} to {next:?}",
                    current.state
                )));
            }
            updated
        };
        self.broadcast(MessageBody::ChallengeUpdate(updated.clone()));
        Ok(updated)
    }

    fn handle_available_peers(&self, peers: &BTreeMap<String, u16>) {
        for (ip, port) in peers {
            self.transport.connect(Connector::new(ip.clone(), *port));
        }
    }

    fn available_peers(&self) -> BTreeMap<String, u16> {
        let local = self.transport.local();
        let mut peers: BTreeMap<String, u16> = self
            .transport
            .own_connections()
            .into_iter()
            .map(|peer| (peer.ip, peer.port))
            .collect();
        peers.insert(local.ip.clone(), local.port);
        peers
    }

    async fn run_discovery(self: Arc<Self>) {
        let mut ticker = time::interval(self.config.discovery_interval());
        loop {
            ticker.tick().await;
            let peers = self.available_peers();
            debug!(peers = peers.len(), "announcing available peers");
            self.broadcast(MessageBody::AvailablePeers(peers));
        }
    }

    fn handle_chunk_push(&self, from: &Connector, chunk_id: &str, file_name: &str, data: &[u8]) {
        let ack = match self.assets.write_chunk(file_name, chunk_id, data) {
            Ok(()) => true,
            Err(err) => {
                warn!(%chunk_id, ?err, "failed to store pushed chunk");
                false
            }
        };
        let reply = MessageBody::ChunkPushReply {
            chunk_id: chunk_id.to_string(),
            ack,
        };
        if let Err(err) = self.send(from, reply) {
            warn!(peer = %from, ?err, "failed to acknowledge chunk");
        }
    }

    fn handle_chunk_pull(&self, from: &Connector, chunk_id: &str, file_name: &str) {
        let data = match self.assets.read_chunk(file_name, chunk_id) {
            Ok(data) => data,
            Err(err) => {
                debug!(%chunk_id, ?err, "cannot serve chunk");
                None
            }
        };
        let reply = MessageBody::ChunkPullReply {
            chunk_id: chunk_id.to_string(),
            data,
        };
        if let Err(err) = self.send(from, reply) {
            warn!(peer = %from, ?err, "failed to answer chunk pull");
        }
    }

    fn handle_chunk_pull_reply(&self, chunk_id: &str, data: Option<Vec<u8>>) {
        match self.pulls.lock().remove(chunk_id) {
            Some(waiter) => {
                let _ = waiter.send(data);
            }
            None => debug!(%chunk_id, "unsolicited chunk"),
        }
    }

    async fn upload_asset(
        self: Arc<Self>,
        file_name: &str,
        content: &[u8],
        tx: Transaction,
    ) -> ChainResult<String> {
        if tx.tx_type != TransactionType::UploadAsset {
            return Err(ChainError::Transaction(
                "asset uploads settle with an UPLOAD_ASSET transaction".into(),
            ));
        }
        tx.verify()?;
        {
            let state = self.state.lock();
            Self::ensure_unknown(&state, &tx.id)?;
        }
        let (asset_hash, chunks) = split_asset(content, self.config.chunk_size)?;
        let mut storage_peers = self.transport.own_connections();
        if storage_peers.is_empty() {
            return Err(ChainError::Asset("no storage peers connected".into()));
        }
        storage_peers.sort();

        let placements: Vec<(&Chunk, &Connector)> = chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| (chunk, &storage_peers[index % storage_peers.len()]))
            .collect();
        let mut upload = self.pending_chunks.register(
            &asset_hash,
            placements
                .iter()
                .map(|(chunk, peer)| (chunk.id.clone(), (*peer).clone())),
        )?;
        info!(%asset_hash, %file_name, chunks = chunks.len(), "uploading asset");

        let mut locations = BTreeMap::new();
        for (chunk, peer) in &placements {
            let push = MessageBody::ChunkPush {
                chunk_id: chunk.id.clone(),
                file_name: file_name.to_string(),
                data: chunk.data.clone(),
            };
            match self.send(peer, push) {
                Ok(()) => {
                    locations.insert(chunk.id.clone(), (*peer).clone());
                }
                Err(err) => warn!(chunk_id = %chunk.id, %peer, ?err, "chunk push failed"),
            }
        }

        let outcome = time::timeout(self.config.upload_timeout(), upload.wait_complete()).await;
        let snapshot = upload.progress();
        drop(upload);
        match outcome {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                warn!(
                    %asset_hash,
                    acknowledged = snapshot.acknowledged,
                    total = snapshot.total,
                    "upload timed out"
                );
                return Err(ChainError::UploadTimeout {
                    asset_hash,
                    acknowledged: snapshot.acknowledged,
                    total: snapshot.total,
                });
            }
        }

        self.assets.write_manifest(&AssetManifest {
            file_name: file_name.to_string(),
            asset_hash: asset_hash.clone(),
            size: content.len(),
            chunks: chunks.into_iter().map(|chunk| chunk.id).collect(),
            locations,
        })?;
        info!(%asset_hash, "asset stored, submitting upload transaction");
        let tx_id = tx.id.clone();
        if !self.handle_pooled(PooledTransaction::Transfer(tx)) {
            return Err(ChainError::Transaction(format!(
                "upload transaction {tx_id} was not admitted"
            )));
        }
        Ok(asset_hash)
    }

    async fn download_asset(self: Arc<Self>, file_name: &str) -> ChainResult<Vec<u8>> {
        let manifest = self
            .assets
            .read_manifest(file_name)?
            .ok_or_else(|| ChainError::Asset(format!("unknown asset {file_name}")))?;
        let mut content = Vec::with_capacity(manifest.size);
        for chunk_id in &manifest.chunks {
            let data = match self.assets.read_chunk(file_name, chunk_id)? {
                Some(data) => data,
                None => {
                    let peer = manifest.locations.get(chunk_id).ok_or_else(|| {
                        ChainError::Asset(format!("no location recorded for chunk {chunk_id}"))
                    })?;
                    self.pull_chunk(peer, file_name, chunk_id).await?
                }
            };
            content.extend_from_slice(&data);
        }
        if crate::chunks::asset_hash(&content) != manifest.asset_hash {
            return Err(ChainError::Asset(format!(
                "reassembled {file_name} does not match its hash"
            )));
        }
        Ok(content)
    }

    async fn pull_chunk(
        &self,
        peer: &Connector,
        file_name: &str,
        chunk_id: &str,
    ) -> ChainResult<Vec<u8>> {
        let (sender, receiver) = oneshot::channel();
        self.pulls.lock().insert(chunk_id.to_string(), sender);
        let request = MessageBody::ChunkPull {
            chunk_id: chunk_id.to_string(),
            file_name: file_name.to_string(),
        };
        if let Err(err) = self.send(peer, request) {
            self.pulls.lock().remove(chunk_id);
            return Err(err);
        }
        match time::timeout(self.config.pull_timeout(), receiver).await {
            Ok(Ok(Some(data))) => Ok(data),
            Ok(Ok(None)) => Err(ChainError::Asset(format!(
                "{peer} does not hold {chunk_id}"
            ))),
            Ok(Err(_)) | Err(_) => {
                self.pulls.lock().remove(chunk_id);
                Err(ChainError::Asset(format!("timed out pulling {chunk_id}")))
            }
        }
    }
}
