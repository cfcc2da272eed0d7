//! Job queue abstraction. The control plane publishes after the job record
//! commits; workers consume and must tolerate redelivery. This crate's queue
//! sits in front of the same structured store the job record lives in, so it
//! is modeled as an in-process channel rather than a second durable table —
//! durability for an unconsumed message comes from the `received`-job
//! republish sweep, not from the queue itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};

/// `{processing_id, user_id, raw_blob_path, metadata}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMessage {
    pub processing_id: Uuid,
    pub user_id: Uuid,
    pub raw_blob_path: String,
    pub enqueued_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(processing_id: Uuid, user_id: Uuid, raw_blob_path: impl Into<String>) -> Self {
        Self {
            processing_id,
            user_id,
            raw_blob_path: raw_blob_path.into(),
            enqueued_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn publish(&self, message: JobMessage) -> StorageResult<()>;

    /// Blocks until a message is available, or returns `None` if every
    /// publisher handle has been dropped and the queue is permanently empty.
    async fn consume(&self) -> Option<JobMessage>;
}

/// In-process, at-least-once (by virtue of the republish sweep, not the channel
/// itself) job queue. A `Mutex<Receiver>` lets multiple worker tasks share one
/// consuming end, matching how `tokio::sync::mpsc` is normally fanned out to a
/// worker pool.
pub struct InProcessQueue {
    sender: mpsc::UnboundedSender<JobMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<JobMessage>>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InProcessQueue {
    async fn publish(&self, message: JobMessage) -> StorageResult<()> {
        self.sender
            .send(message)
            .map_err(|e| StorageError::other(format!("job queue is closed: {e}")))
    }

    async fn consume(&self) -> Option<JobMessage> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_consume_round_trips() {
        let queue = InProcessQueue::new();
        let msg = JobMessage::new(Uuid::new_v4(), Uuid::new_v4(), "raw_data/x.json");
        queue.publish(msg.clone()).await.unwrap();
        let received = queue.consume().await.unwrap();
        assert_eq!(received.processing_id, msg.processing_id);
    }

    #[tokio::test]
    async fn messages_are_delivered_in_publish_order() {
        let queue = InProcessQueue::new();
        let first = JobMessage::new(Uuid::new_v4(), Uuid::new_v4(), "a.json");
        let second = JobMessage::new(Uuid::new_v4(), Uuid::new_v4(), "b.json");
        queue.publish(first.clone()).await.unwrap();
        queue.publish(second.clone()).await.unwrap();
        assert_eq!(queue.consume().await.unwrap().processing_id, first.processing_id);
        assert_eq!(queue.consume().await.unwrap().processing_id, second.processing_id);
    }
}
