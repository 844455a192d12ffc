use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chunks::PendingChunks;
use crate::protocol::Connector;

/// A `CHUNK_PUSH_REPLY` handed over by the dispatcher. `from` is the
/// connection the reply arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    pub chunk_id: String,
    pub ack: bool,
    pub from: Connector,
}

/// Drains chunk acknowledgements and flips the matching tracker entries.
pub struct ChunkAckWorker {
    pending: Arc<PendingChunks>,
    receiver: mpsc::UnboundedReceiver<ChunkAck>,
}

impl ChunkAckWorker {
    pub fn new(
        pending: Arc<PendingChunks>,
    ) -> (mpsc::UnboundedSender<ChunkAck>, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (sender, Self { pending, receiver })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(ack) = self.receiver.recv().await {
            self.process(ack);
        }
        debug!("chunk acknowledgement queue closed");
    }

    fn process(&self, ack: ChunkAck) {
        if !ack.ack {
            info!(chunk_id = %ack.chunk_id, peer = %ack.from, "storage peer refused chunk");
            return;
        }
        match self.pending.acknowledge(&ack.chunk_id, &ack.from) {
            Ok(progress) => debug!(
                chunk_id = %ack.chunk_id,
                acknowledged = progress.acknowledged,
                total = progress.total,
                "chunk acknowledged"
            ),
            Err(err) => debug!(peer = %ack.from, ?err, "ignoring chunk acknowledgement"),
        }
    }
}
