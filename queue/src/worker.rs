use crate::{Delivery, JobQueue};
use errors::Result;
use log::{debug, error, info, warn};
use metrics::gauge;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};

/// Transient failures requeue with exponential backoff starting here.
const RETRY_BASE: Duration = Duration::from_secs(3);

/// Pulls deliveries for one topic and runs a typed handler under a
/// concurrency semaphore and an optional throughput gate. While a handler
/// runs, the delivery's lease is renewed on a ticker; if the process dies
/// the claimer redelivers after the lease expires.
pub struct Worker {
    pub name: String,
    concurrency: usize,
    rate: Option<Arc<utils::rate_limit::RateGate>>,
    lease: Duration,
    retry_base: Duration,
    backend: Arc<dyn JobQueue>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Worker {
    pub fn new(
        name: &str,
        concurrency: usize,
        lease: Duration,
        backend: Arc<dyn JobQueue>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            name: name.to_string(),
            concurrency,
            rate: None,
            lease,
            retry_base: RETRY_BASE,
            backend,
            shutdown_rx,
        }
    }

    pub fn with_rate_per_sec(mut self, max_per_sec: u32) -> Self {
        if max_per_sec > 0 {
            self.rate = Some(Arc::new(utils::rate_limit::RateGate::per_second(max_per_sec)));
        }
        self
    }

    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    pub async fn run<T, F, Fut>(mut self, mut receiver: mpsc::Receiver<Delivery>, handler: F)
    where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        info!(
            "Starting {} worker (concurrency {})",
            self.name, self.concurrency
        );
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let metric_label = self.name.clone();

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("{} worker received shutdown signal", self.name);
                    break;
                }
                delivery_opt = receiver.recv() => {
                    let Some(delivery) = delivery_opt else {
                        info!("{} worker channel closed", self.name);
                        break;
                    };

                    if let Some(rate) = &self.rate {
                        rate.acquire().await;
                    }

                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(p) => p,
                        Err(_) => break,
                    };

                    let handler = handler.clone();
                    let backend = self.backend.clone();
                    let lease = self.lease;
                    let retry_base = self.retry_base;
                    let metric_label = metric_label.clone();

                    tokio::spawn(async move {
                        let _permit = permit;
                        gauge!("worker_active_jobs", "worker" => metric_label.clone()).increment(1.0);
                        Self::execute::<T, F, Fut>(delivery, handler, backend, lease, retry_base).await;
                        gauge!("worker_active_jobs", "worker" => metric_label).decrement(1.0);
                    });
                }
            }
        }

        // Drain: wait for in-flight handlers before returning so shutdown
        // can bound the grace period from the outside.
        let _ = semaphore.acquire_many(self.concurrency as u32).await;
        info!("{} worker loop ended", self.name);
    }

    async fn execute<T, F, Fut>(
        delivery: Delivery,
        handler: F,
        backend: Arc<dyn JobQueue>,
        lease: Duration,
        retry_base: Duration,
    ) where
        T: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let job: T = match delivery.envelope.decode() {
            Ok(job) => job,
            Err(e) => {
                error!("Undecodable job {}: {}", delivery.envelope.id, e);
                let _ = delivery.discard(format!("decode: {e}")).await;
                return;
            }
        };

        // Renew the lease at a third of its duration while the handler runs.
        let renew_backend = backend.clone();
        let renew_id = delivery.delivery_id().to_string();
        let renewal = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(lease / 3);
            ticker.tick().await; // immediate first tick is a no-op
            loop {
                ticker.tick().await;
                if let Err(e) = renew_backend.renew(&renew_id).await {
                    debug!("Lease renewal failed for {}: {}", renew_id, e);
                    break;
                }
            }
        });

        let result = handler(job).await;
        renewal.abort();

        let envelope = &delivery.envelope;
        match result {
            Ok(()) => {
                if let Err(e) = delivery.ack().await {
                    error!("Failed to ack delivery: {}", e);
                }
            }
            Err(e) if e.is_transient() && envelope.attempts + 1 < envelope.max_attempts => {
                let delay = retry_base * 2u32.pow(envelope.attempts.min(6));
                warn!(
                    "Job {} failed transiently (attempt {}/{}), retrying in {:?}: {}",
                    envelope.id,
                    envelope.attempts + 1,
                    envelope.max_attempts,
                    delay,
                    e
                );
                if let Err(e) = delivery.retry(delay, e.to_string()).await {
                    error!("Failed to requeue delivery: {}", e);
                }
            }
            Err(e) => {
                warn!("Job {} dead-lettered: {}", envelope.id, e);
                if let Err(e) = delivery.discard(e.to_string()).await {
                    error!("Failed to dead-letter delivery: {}", e);
                }
            }
        }
    }
}
