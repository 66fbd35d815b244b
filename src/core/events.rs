// src/core/events.rs

//! The distribution hub for applied write commands.
//!
//! The command loop publishes each mutation's RESP-encoded bytes exactly
//! once; the bus fans them out to the AOF pipeline and to any replication
//! subscribers. Replicas bootstrap from a point-in-time RDB image (see
//! `RdbSaver::full_sync_image`) and then follow this live stream.

use crate::core::JasperDBError;
use crate::core::persistence::aof_batch::AofBatchWriter;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// The capacity of the broadcast channel for replication subscribers.
/// Large enough to absorb command bursts without lagging out a replica
/// that is merely slow, not dead.
const BROADCAST_BUS_CAPACITY: usize = 16384;

pub struct CommandBus {
    /// One-to-many live command stream for replication.
    replication_sender: broadcast::Sender<Bytes>,
    /// The AOF pipeline, when AOF persistence is enabled.
    aof_writer: Option<Arc<AofBatchWriter>>,
}

impl CommandBus {
    pub fn new(aof_writer: Option<Arc<AofBatchWriter>>) -> Self {
        let (replication_sender, _) = broadcast::channel(BROADCAST_BUS_CAPACITY);
        Self {
            replication_sender,
            aof_writer,
        }
    }

    /// Publishes one applied command to every consumer. The AOF append is
    /// awaited so its durability guarantees (notably the `always` fsync
    /// policy) hold for the caller; replication delivery is fire-and-forget.
    pub async fn publish(&self, bytes: Bytes) -> Result<(), JasperDBError> {
        if self.replication_sender.send(bytes.clone()).is_err() {
            debug!("published a command with no active replication subscribers");
        }
        match &self.aof_writer {
            Some(writer) => writer.append(bytes).await,
            None => Ok(()),
        }
    }

    /// Provides a new receiver for a replication task to follow the live
    /// command stream. A receiver that falls more than the bus capacity
    /// behind observes a `Lagged` error and must resynchronize.
    pub fn subscribe_for_replication(&self) -> broadcast::Receiver<Bytes> {
        self.replication_sender.subscribe()
    }

    pub fn replication_subscriber_count(&self) -> usize {
        self.replication_sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_every_subscriber_in_order() {
        let bus = CommandBus::new(None);
        let mut first = bus.subscribe_for_replication();
        let mut second = bus.subscribe_for_replication();
        assert_eq!(bus.replication_subscriber_count(), 2);

        for i in 0..10u8 {
            bus.publish(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(first.recv().await.unwrap(), Bytes::from(vec![i]));
            assert_eq!(second.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_not_an_error() {
        let bus = CommandBus::new(None);
        bus.publish(Bytes::from_static(b"x")).await.unwrap();
    }
}
