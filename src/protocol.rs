use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Block, Challenge, ChallengeTx, Transaction};

/// Address a peer is reachable under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Connector {
    pub ip: String,
    pub port: u16,
}

impl Connector {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Transaction = 1,
    Challenge = 2,
    ChallengeUpdate = 3,
    Block = 4,
    BlockchainRequest = 5,
    Blockchain = 6,
    AvailablePeers = 7,
    ChunkPush = 8,
    ChunkPushReply = 9,
    ChunkPull = 10,
    ChunkPullReply = 11,
}

impl MessageType {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Transaction),
            2 => Some(MessageType::Challenge),
            3 => Some(MessageType::ChallengeUpdate),
            4 => Some(MessageType::Block),
            5 => Some(MessageType::BlockchainRequest),
            6 => Some(MessageType::Blockchain),
            7 => Some(MessageType::AvailablePeers),
            8 => Some(MessageType::ChunkPush),
            9 => Some(MessageType::ChunkPushReply),
            10 => Some(MessageType::ChunkPull),
            11 => Some(MessageType::ChunkPullReply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    Transaction(Transaction),
    Challenge(ChallengeTx),
    ChallengeUpdate(Challenge),
    Block(Block),
    BlockchainRequest,
    Blockchain(Vec<Block>),
    /// `ip -> port` of every peer the sender is connected to, itself included.
    AvailablePeers(BTreeMap<String, u16>),
    ChunkPush {
        chunk_id: String,
        file_name: String,
        data: Vec<u8>,
    },
    ChunkPushReply {
        chunk_id: String,
        ack: bool,
    },
    ChunkPull {
        chunk_id: String,
        file_name: String,
    },
    ChunkPullReply {
        chunk_id: String,
        data: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: Connector,
    pub body: MessageBody,
}

impl Message {
    pub fn new(sender: Connector, body: MessageBody) -> Self {
        Self { sender, body }
    }

    pub fn message_type(&self) -> MessageType {
        match &self.body {
            MessageBody::Transaction(_) => MessageType::Transaction,
            MessageBody::Challenge(_) => MessageType::Challenge,
            MessageBody::ChallengeUpdate(_) => MessageType::ChallengeUpdate,
            MessageBody::Block(_) => MessageType::Block,
            MessageBody::BlockchainRequest => MessageType::BlockchainRequest,
            MessageBody::Blockchain(_) => MessageType::Blockchain,
            MessageBody::AvailablePeers(_) => MessageType::AvailablePeers,
            MessageBody::ChunkPush { .. } => MessageType::ChunkPush,
            MessageBody::ChunkPushReply { .. } => MessageType::ChunkPushReply,
            MessageBody::ChunkPull { .. } => MessageType::ChunkPull,
            MessageBody::ChunkPullReply { .. } => MessageType::ChunkPullReply,
        }
    }

    /// One type byte followed by the bincode encoded envelope.
    pub fn encode(&self) -> ChainResult<Vec<u8>> {
        let mut bytes = vec![self.message_type() as u8];
        bytes.extend(bincode::serialize(self)?);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> ChainResult<Self> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| ChainError::Protocol("empty frame".into()))?;
        let message_type = MessageType::from_byte(*tag)
            .ok_or_else(|| ChainError::Protocol(format!("unknown message type: {tag}")))?;
        let message: Message = bincode::deserialize(body)?;
        if message.message_type() != message_type {
            return Err(ChainError::Protocol(format!(
                "type byte {:?} does not match payload {:?}",
                message_type,
                message.message_type()
            )));
        }
        Ok(message)
    }
}
