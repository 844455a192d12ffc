#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use beez_node::config::{GenesisAccount, GenesisConfig, NodeConfig};
use beez_node::crypto::Wallet;
use beez_node::errors::{ChainError, ChainResult};
use beez_node::node::{Node, NodeHandle};
use beez_node::protocol::{Connector, Message, MessageType};
use beez_node::transport::{FrameHandler, PeerTransport};
use beez_node::types::{Transaction, TransactionType};

pub const CLIENT_BALANCE: u128 = 10_000;

pub fn connector(port: u16) -> Connector {
    Connector::new("127.0.0.1", port)
}

pub fn genesis(stakers: &[&Wallet], clients: &[&Wallet]) -> GenesisConfig {
    let mut accounts: Vec<GenesisAccount> = stakers
        .iter()
        .map(|wallet| GenesisAccount {
            public_key: wallet.public_key_string(),
            balance: 1_000,
            stake: "100".into(),
        })
        .collect();
    accounts.extend(clients.iter().map(|wallet| GenesisAccount {
        public_key: wallet.public_key_string(),
        balance: CLIENT_BALANCE,
        stake: "0".into(),
    }));
    GenesisConfig {
        chain_id: "beez-test".into(),
        accounts,
    }
}

pub fn node_config(dir: &Path, genesis: GenesisConfig) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.data_dir = dir.join("data");
    config.key_path = dir.join("keys/node.toml");
    config.asset_dir = dir.join("assets");
    config.chunk_size = 4;
    config.upload_timeout_ms = 300;
    config.pull_timeout_ms = 300;
    config.genesis = genesis;
    config
}

pub fn transfer(wallet: &Wallet, receiver: &str, amount: u128) -> Transaction {
    signed(wallet, receiver, amount, TransactionType::Transfer)
}

pub fn signed(
    wallet: &Wallet,
    receiver: &str,
    amount: u128,
    tx_type: TransactionType,
) -> Transaction {
    let mut tx = Transaction::new(wallet.public_key_string(), receiver.into(), amount, tx_type);
    tx.sign(wallet);
    tx
}

pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Transport that records every outbound frame instead of sending it.
pub struct RecordingTransport {
    local: Connector,
    peers: Vec<Connector>,
    sent: Mutex<Vec<(Option<Connector>, Message)>>,
}

impl RecordingTransport {
    pub fn new(local: Connector, peers: Vec<Connector>) -> Arc<Self> {
        Arc::new(Self {
            local,
            peers,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// `(target, message)` pairs; `None` marks a broadcast.
    pub fn sent(&self) -> Vec<(Option<Connector>, Message)> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, kind: MessageType) -> Vec<(Option<Connector>, Message)> {
        self.sent()
            .into_iter()
            .filter(|(_, message)| message.message_type() == kind)
            .collect()
    }

    fn record(&self, target: Option<Connector>, frame: &[u8]) {
        let message = Message::decode(frame).expect("node emits decodable frames");
        self.sent.lock().push((target, message));
    }
}

impl PeerTransport for RecordingTransport {
    fn local(&self) -> &Connector {
        &self.local
    }

    fn send(&self, target: &Connector, frame: Vec<u8>) -> ChainResult<()> {
        self.record(Some(target.clone()), &frame);
        Ok(())
    }

    fn broadcast(&self, frame: Vec<u8>) {
        self.record(None, &frame);
    }

    fn own_connections(&self) -> Vec<Connector> {
        self.peers.clone()
    }

    fn neighbor(&self) -> Option<Connector> {
        None
    }

    fn connect(&self, _target: Connector) {}
}

/// In-process network: frames are queued and delivered by
/// [`LoopbackNetwork::deliver_all`], so scenarios run deterministically.
#[derive(Default)]
pub struct LoopbackNetwork {
    handlers: Mutex<HashMap<Connector, Arc<dyn FrameHandler>>>,
    links: Mutex<BTreeSet<(Connector, Connector)>>,
    queue: Mutex<VecDeque<(Connector, Connector, Vec<u8>)>>,
    delivered: Mutex<Vec<(Connector, Connector, MessageType)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn transport(self: &Arc<Self>, local: Connector) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            local,
            network: self.clone(),
        })
    }

    /// Builds a node on this network and registers its dispatcher.
    pub fn spawn_node(
        self: &Arc<Self>,
        local: Connector,
        config: NodeConfig,
        wallet: Wallet,
    ) -> NodeHandle {
        let node = Node::new(config, wallet, self.transport(local.clone())).expect("node");
        self.handlers.lock().insert(local, node.dispatcher());
        node.spawn_ack_worker();
        node.handle()
    }

    pub fn link(&self, a: &Connector, b: &Connector) {
        let mut links = self.links.lock();
        links.insert((a.clone(), b.clone()));
        links.insert((b.clone(), a.clone()));
    }

    fn peers_of(&self, local: &Connector) -> Vec<Connector> {
        self.links
            .lock()
            .iter()
            .filter(|(from, _)| from == local)
            .map(|(_, to)| to.clone())
            .collect()
    }

    fn enqueue(&self, from: &Connector, to: &Connector, frame: Vec<u8>) {
        self.queue
            .lock()
            .push_back((from.clone(), to.clone(), frame));
    }

    /// Delivers queued frames, including the ones produced while
    /// delivering, until the network is quiet. Returns the number delivered.
    pub fn deliver_all(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = self.queue.lock().pop_front();
            let Some((from, to, frame)) = next else {
                return delivered;
            };
            delivered += 1;
            assert!(delivered < 10_000, "message storm on loopback network");
            if let Ok(message) = Message::decode(&frame) {
                self.delivered
                    .lock()
                    .push((from.clone(), to.clone(), message.message_type()));
            }
            let handler = self.handlers.lock().get(&to).cloned();
            if let Some(handler) = handler {
                handler.handle_frame(&from, frame);
            }
        }
    }

    pub fn delivered_of(&self, kind: MessageType) -> Vec<(Connector, Connector)> {
        self.delivered
            .lock()
            .iter()
            .filter(|(_, _, delivered)| *delivered == kind)
            .map(|(from, to, _)| (from.clone(), to.clone()))
            .collect()
    }
}

pub struct LoopbackTransport {
    local: Connector,
    network: Arc<LoopbackNetwork>,
}

impl PeerTransport for LoopbackTransport {
    fn local(&self) -> &Connector {
        &self.local
    }

    fn send(&self, target: &Connector, frame: Vec<u8>) -> ChainResult<()> {
        if !self.network.peers_of(&self.local).contains(target) {
            return Err(ChainError::Protocol(format!("not connected to {target}")));
        }
        self.network.enqueue(&self.local, target, frame);
        Ok(())
    }

    fn broadcast(&self, frame: Vec<u8>) {
        for peer in self.network.peers_of(&self.local) {
            self.network.enqueue(&self.local, &peer, frame.clone());
        }
    }

    fn own_connections(&self) -> Vec<Connector> {
        self.network.peers_of(&self.local)
    }

    fn neighbor(&self) -> Option<Connector> {
        None
    }

    fn connect(&self, target: Connector) {
        if target != self.local {
            self.network.link(&self.local, &target);
        }
    }
}
