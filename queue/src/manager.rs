use crate::{Delivery, JobEnvelope, JobOptions, JobQueue};
use common::model::message::{PostCommentJob, ProcessScheduleJob, SimulateViewJob, TopicType};
use errors::Result;
use log::debug;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Typed facade over the job queue backend: topic names and dedup ids live
/// here so callers never hand-build either.
pub struct QueueManager {
    backend: Arc<dyn JobQueue>,
}

impl QueueManager {
    pub fn new(backend: Arc<dyn JobQueue>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> Arc<dyn JobQueue> {
        self.backend.clone()
    }

    pub async fn enqueue<P: Serialize>(
        &self,
        topic: TopicType,
        job_id: String,
        payload: &P,
        opts: JobOptions,
    ) -> Result<bool> {
        let envelope = JobEnvelope::new(job_id, payload, &opts)?;
        let enqueued = self
            .backend
            .enqueue(topic.as_str(), envelope, opts.delay)
            .await?;
        if !enqueued {
            debug!("Job deduplicated on {}", topic.as_str());
        }
        Ok(enqueued)
    }

    /// Schedule-processing tick. `job_id` encodes the chain (`immediate-7`,
    /// `once-7`, `interval-7-<epoch>`, ...) and is always deduplicated so a
    /// re-setup cannot start a second chain.
    pub async fn enqueue_process_schedule(
        &self,
        job: &ProcessScheduleJob,
        job_id: String,
        delay: Duration,
    ) -> Result<bool> {
        self.enqueue(
            TopicType::ScheduleProcessing,
            job_id,
            job,
            JobOptions::delayed(delay).with_dedup(),
        )
        .await
    }

    /// One job per comment row, keyed by the row id.
    pub async fn enqueue_post_comment(&self, job: &PostCommentJob, delay: Duration) -> Result<bool> {
        self.enqueue(
            TopicType::PostComment,
            job.job_id(),
            job,
            JobOptions::delayed(delay).with_dedup(),
        )
        .await
    }

    pub async fn enqueue_simulate_view(&self, job: &SimulateViewJob, delay: Duration) -> Result<bool> {
        self.enqueue(
            TopicType::SimulateView,
            format!("view-{}-{}", job.view_schedule_id, job.run_id),
            job,
            JobOptions::delayed(delay),
        )
        .await
    }

    pub async fn subscribe(&self, topic: TopicType, buffer: usize) -> Result<mpsc::Receiver<Delivery>> {
        let (tx, rx) = mpsc::channel(buffer);
        self.backend.subscribe(topic.as_str(), tx).await?;
        Ok(rx)
    }

    pub async fn remove_delayed(&self, topic: TopicType, job_id: &str) -> Result<bool> {
        self.backend.remove_delayed(topic.as_str(), job_id).await
    }

    pub async fn scheduled_jobs(&self, topic: TopicType) -> Result<Vec<JobEnvelope>> {
        self.backend.scheduled_jobs(topic.as_str()).await
    }

    pub async fn read_dlq(
        &self,
        topic: TopicType,
        count: usize,
    ) -> Result<Vec<(String, JobEnvelope, String)>> {
        self.backend.read_dlq(topic.as_str(), count).await
    }

    pub async fn clean_storage(&self) -> Result<()> {
        self.backend.clean_storage().await
    }
}
