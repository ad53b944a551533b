//! In-memory [`JobQueue`] used by unit tests and single-node dev runs. Same
//! visible semantics as the Redis backend: delayed promotion, dedup ids,
//! retry-to-delayed and a DLQ, minus durability.

use crate::{AckAction, AckMessage, Delivery, JobEnvelope, JobQueue};
use async_trait::async_trait;
use errors::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

#[derive(Default)]
struct Inner {
    delayed: Vec<(Instant, String, JobEnvelope)>,
    routes: HashMap<String, mpsc::Sender<Delivery>>,
    dedup: HashSet<String>,
    dlq: HashMap<String, Vec<(JobEnvelope, String)>>,
    seq: u64,
}

pub struct MemoryJobQueue {
    inner: Arc<Mutex<Inner>>,
    ack_tx: mpsc::Sender<AckMessage>,
}

impl MemoryJobQueue {
    pub fn new() -> Arc<Self> {
        let inner: Arc<Mutex<Inner>> = Arc::default();
        let (ack_tx, mut ack_rx) = mpsc::channel::<AckMessage>(1024);

        let queue = Arc::new(Self {
            inner: inner.clone(),
            ack_tx,
        });

        // Ack processor.
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(msg) = ack_rx.recv().await {
                    let mut state = inner.lock().await;
                    let topic = msg
                        .delivery_id
                        .split_once('@')
                        .map(|(t, _)| t.to_string())
                        .unwrap_or_default();
                    match msg.action {
                        AckAction::Ack => {
                            if msg.envelope.dedup {
                                state.dedup.remove(&dedup_key(&topic, &msg.envelope.id));
                            }
                        }
                        AckAction::Retry { delay, .. } => {
                            let mut envelope = msg.envelope;
                            envelope.attempts += 1;
                            state
                                .delayed
                                .push((Instant::now() + delay, topic, envelope));
                        }
                        AckAction::Dead { reason } => {
                            if msg.envelope.dedup {
                                state.dedup.remove(&dedup_key(&topic, &msg.envelope.id));
                            }
                            state
                                .dlq
                                .entry(topic)
                                .or_default()
                                .push((msg.envelope, reason));
                        }
                    }
                }
            });
        }

        // Promoter pump.
        {
            let inner = inner.clone();
            let ack_tx = queue.ack_tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(10));
                loop {
                    ticker.tick().await;
                    let due: Vec<(String, JobEnvelope, String)> = {
                        let mut state = inner.lock().await;
                        let now = Instant::now();
                        let parked = std::mem::take(&mut state.delayed);
                        let mut due = Vec::new();
                        let mut keep = Vec::new();
                        for (ready_at, topic, envelope) in parked {
                            if ready_at <= now && state.routes.contains_key(&topic) {
                                state.seq += 1;
                                let delivery_id = format!("{}@{}", topic, state.seq);
                                due.push((topic, envelope, delivery_id));
                            } else {
                                keep.push((ready_at, topic, envelope));
                            }
                        }
                        state.delayed = keep;
                        due
                    };

                    for (topic, envelope, delivery_id) in due {
                        let sender = {
                            let state = inner.lock().await;
                            state.routes.get(&topic).cloned()
                        };
                        if let Some(sender) = sender {
                            let delivery = Delivery {
                                envelope,
                                delivery_id,
                                ack_tx: ack_tx.clone(),
                            };
                            let _ = sender.send(delivery).await;
                        }
                    }
                }
            });
        }

        queue
    }

    pub async fn dlq_len(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .await
            .dlq
            .get(topic)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    pub async fn pending_len(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .await
            .delayed
            .iter()
            .filter(|(_, t, _)| t == topic)
            .count()
    }
}

fn dedup_key(topic: &str, id: &str) -> String {
    format!("{}:{}", topic, id)
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, topic: &str, envelope: JobEnvelope, delay: Duration) -> Result<bool> {
        let mut state = self.inner.lock().await;
        if envelope.dedup {
            let key = dedup_key(topic, &envelope.id);
            if !state.dedup.insert(key) {
                return Ok(false);
            }
        }
        state
            .delayed
            .push((Instant::now() + delay, topic.to_string(), envelope));
        Ok(true)
    }

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Delivery>) -> Result<()> {
        self.inner
            .lock()
            .await
            .routes
            .insert(topic.to_string(), sender);
        Ok(())
    }

    async fn renew(&self, _delivery_id: &str) -> Result<()> {
        Ok(())
    }

    async fn remove_delayed(&self, topic: &str, job_id: &str) -> Result<bool> {
        let mut state = self.inner.lock().await;
        let before = state.delayed.len();
        let mut removed_dedup = None;
        state.delayed.retain(|(_, t, envelope)| {
            let matched = t == topic && envelope.id == job_id;
            if matched && envelope.dedup {
                removed_dedup = Some(dedup_key(t, &envelope.id));
            }
            !matched
        });
        if let Some(key) = removed_dedup {
            state.dedup.remove(&key);
        }
        Ok(state.delayed.len() != before)
    }

    async fn scheduled_jobs(&self, topic: &str) -> Result<Vec<JobEnvelope>> {
        Ok(self
            .inner
            .lock()
            .await
            .delayed
            .iter()
            .filter(|(_, t, _)| t == topic)
            .map(|(_, _, e)| e.clone())
            .collect())
    }

    async fn read_dlq(&self, topic: &str, count: usize) -> Result<Vec<(String, JobEnvelope, String)>> {
        Ok(self
            .inner
            .lock()
            .await
            .dlq
            .get(topic)
            .map(|entries| {
                entries
                    .iter()
                    .rev()
                    .take(count)
                    .enumerate()
                    .map(|(i, (e, r))| (i.to_string(), e.clone(), r.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn clean_storage(&self) -> Result<()> {
        Ok(())
    }
}
