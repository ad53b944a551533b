pub mod manager;
pub mod redis;
pub mod testing;
pub mod worker;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use errors::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

pub use manager::QueueManager;
pub use redis::RedisJobQueue;
pub use worker::Worker;

/// What the queue stores and redelivers. `attempts` travels inside the
/// envelope, so a retry is a brand-new stream entry with the counter bumped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// Caller-chosen id; doubles as the dedup key when `dedup` is set.
    pub id: String,
    pub attempts: u32,
    pub max_attempts: u32,
    /// When true, a second enqueue with the same id is dropped while the
    /// first is still outstanding.
    pub dedup: bool,
    pub payload: serde_json::Value,
}

impl JobEnvelope {
    pub fn new<P: Serialize>(id: String, payload: &P, opts: &JobOptions) -> Result<Self> {
        Ok(Self {
            id,
            attempts: 0,
            max_attempts: opts.max_attempts,
            dedup: opts.dedup,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            errors::QueueError::DeserializationFailed(Box::new(e)).into()
        })
    }
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub delay: Duration,
    pub dedup: bool,
    pub max_attempts: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            dedup: false,
            max_attempts: 3,
        }
    }
}

impl JobOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn with_dedup(mut self) -> Self {
        self.dedup = true;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

#[derive(Debug)]
pub enum AckAction {
    Ack,
    /// Requeue after `delay`; the envelope goes back with `attempts + 1`.
    Retry { delay: Duration, reason: String },
    /// Classified-terminal or exhausted; park in the DLQ with a reason.
    Dead { reason: String },
}

pub(crate) struct AckMessage {
    pub delivery_id: String,
    pub envelope: JobEnvelope,
    pub action: AckAction,
}

/// One message handed to a worker. Exactly one of `ack`/`retry`/`discard`
/// must be called; a crashed holder is recovered by the stalled claimer
/// after its lease runs out.
pub struct Delivery {
    pub envelope: JobEnvelope,
    pub(crate) delivery_id: String,
    pub(crate) ack_tx: mpsc::Sender<AckMessage>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.envelope.id)
            .field("attempts", &self.envelope.attempts)
            .field("delivery_id", &self.delivery_id)
            .finish()
    }
}

impl Delivery {
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    async fn finish(self, action: AckAction) -> Result<()> {
        let msg = AckMessage {
            delivery_id: self.delivery_id,
            envelope: self.envelope,
            action,
        };
        self.ack_tx.send(msg).await.map_err(|_| {
            errors::QueueError::OperationFailed("ack channel closed".to_string().into()).into()
        })
    }

    pub async fn ack(self) -> Result<()> {
        self.finish(AckAction::Ack).await
    }

    pub async fn retry(self, delay: Duration, reason: String) -> Result<()> {
        self.finish(AckAction::Retry { delay, reason }).await
    }

    pub async fn discard(self, reason: String) -> Result<()> {
        self.finish(AckAction::Dead { reason }).await
    }
}

/// Durable queue contract the engine relies on: delayed jobs, unique job
/// ids, at-least-once delivery, stalled recovery and a DLQ.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// `Ok(false)` means the envelope was deduplicated away.
    async fn enqueue(&self, topic: &str, envelope: JobEnvelope, delay: Duration) -> Result<bool>;

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Delivery>) -> Result<()>;

    /// Resets the idle clock of an in-flight delivery so the claimer leaves
    /// it alone while a slow handler is still making progress.
    async fn renew(&self, delivery_id: &str) -> Result<()>;

    /// Drops a not-yet-promoted delayed job. Used when a schedule is paused
    /// or deleted and by the orphan sweep.
    async fn remove_delayed(&self, topic: &str, job_id: &str) -> Result<bool>;

    /// Delayed envelopes currently parked for `topic`.
    async fn scheduled_jobs(&self, topic: &str) -> Result<Vec<JobEnvelope>>;

    async fn read_dlq(&self, topic: &str, count: usize) -> Result<Vec<(String, JobEnvelope, String)>>;

    async fn clean_storage(&self) -> Result<()>;
}
