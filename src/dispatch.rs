use tracing::debug;

use crate::node::NodeHandle;
use crate::protocol::{Connector, Message, MessageBody};
use crate::transport::FrameHandler;
use crate::worker::ChunkAck;

/// Decodes inbound frames and routes each message kind to its handler.
///
/// Handlers log and drop whatever they reject, so nothing here ever fails back
/// into the connection's receive loop.
#[derive(Clone)]
pub struct MessageDispatcher {
    node: NodeHandle,
}

impl MessageDispatcher {
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    pub fn dispatch(&self, from: &Connector, message: Message) {
        let Message { body, .. } = message;
        match body {
            MessageBody::Transaction(tx) => self.node.handle_transaction(tx),
            MessageBody::Challenge(challenge_tx) => self.node.handle_challenge_tx(challenge_tx),
            MessageBody::ChallengeUpdate(challenge) => {
                self.node.handle_challenge_update(challenge)
            }
            MessageBody::Block(block) => self.node.handle_block(block),
            MessageBody::BlockchainRequest => self.node.handle_blockchain_request(from),
            MessageBody::Blockchain(blocks) => self.node.handle_blockchain(blocks),
            MessageBody::AvailablePeers(peers) => self.node.handle_available_peers(&peers),
            MessageBody::ChunkPush {
                chunk_id,
                file_name,
                data,
            } => self.node.handle_chunk_push(from, &chunk_id, &file_name, &data),
            MessageBody::ChunkPushReply { chunk_id, ack } => {
                self.node.enqueue_chunk_ack(ChunkAck {
                    chunk_id,
                    ack,
                    from: from.clone(),
                })
            }
            MessageBody::ChunkPull {
                chunk_id,
                file_name,
            } => self.node.handle_chunk_pull(from, &chunk_id, &file_name),
            MessageBody::ChunkPullReply { chunk_id, data } => {
                self.node.handle_chunk_pull_reply(&chunk_id, data)
            }
        }
    }
}

impl FrameHandler for MessageDispatcher {
    fn handle_frame(&self, from: &Connector, frame: Vec<u8>) {
        match Message::decode(&frame) {
            Ok(message) => self.dispatch(from, message),
            Err(err) => debug!(peer = %from, ?err, "dropping undecodable frame"),
        }
    }
}
