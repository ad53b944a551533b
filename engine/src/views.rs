use crate::broker::Broker;
use crate::repository::ScheduleRepository;
use async_trait::async_trait;
use cacheable::CacheService;
use chrono::Utc;
use common::model::config::ViewerConfig;
use common::model::entity::schedule::ScheduleStatus;
use common::model::entity::ViewScheduleModel;
use common::model::message::SimulateViewJob;
use dashmap::DashMap;
use errors::{Result, ServiceError};
use log::{debug, error, info, warn};
use queue::QueueManager;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Boundary to the browser-automation service; the engine only knows this
/// call shape.
#[async_trait]
pub trait ViewerService: Send + Sync {
    async fn simulate(&self, video_id: &str, min_watch_secs: i32, max_watch_secs: i32) -> Result<()>;
}

pub struct HttpViewerService {
    url: String,
    client: reqwest::Client,
}

impl HttpViewerService {
    pub fn new(config: &ViewerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            // Browser navigation is slow by design.
            .timeout(Duration::from_secs(config.navigation_timeout_secs))
            .build()
            .map_err(|e| {
                errors::Error::new(errors::ErrorKind::Service, Some(Box::new(e) as errors::BoxError))
            })?;
        Ok(Self {
            url: config.service_url.clone(),
            client,
        })
    }
}

#[async_trait]
impl ViewerService for HttpViewerService {
    async fn simulate(&self, video_id: &str, min_watch_secs: i32, max_watch_secs: i32) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({
                "videoId": video_id,
                "minWatchTime": min_watch_secs,
                "maxWatchTime": max_watch_secs,
            }))
            .send()
            .await
            .map_err(|e| {
                errors::Error::new(errors::ErrorKind::Service, Some(Box::new(e) as errors::BoxError))
            })?;
        if !response.status().is_success() {
            return Err(ServiceError::ServiceUnavailable.into());
        }
        Ok(())
    }
}

/// Stand-in when no viewer service is configured: views are rolled and
/// logged but no browser session runs.
pub struct LogOnlyViewerService;

#[async_trait]
impl ViewerService for LogOnlyViewerService {
    async fn simulate(&self, video_id: &str, min_watch_secs: i32, max_watch_secs: i32) -> Result<()> {
        info!(
            "Viewer service not configured; would watch {} for {}..{}s",
            video_id, min_watch_secs, max_watch_secs
        );
        Ok(())
    }
}

/// Per-video delay inside one tick: targets are spread evenly across the
/// whole interval.
pub fn view_stagger_ms(interval_ms: i64, video_count: usize, index: usize) -> i64 {
    if video_count == 0 {
        return 0;
    }
    (interval_ms / video_count as i64) * index as i64
}

/// Thin mirror of the schedule driver for watch simulation. One tick loop
/// per active view schedule, `SET NX` per firing for multi-node dedup.
pub struct ViewScheduler {
    repo: Arc<ScheduleRepository>,
    queue: Arc<QueueManager>,
    cache: Arc<CacheService>,
    ticks: DashMap<i64, tokio::task::JoinHandle<()>>,
}

impl ViewScheduler {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        queue: Arc<QueueManager>,
        cache: Arc<CacheService>,
    ) -> Self {
        Self {
            repo,
            queue,
            cache,
            ticks: DashMap::new(),
        }
    }

    pub async fn resume_active(self: &Arc<Self>) -> Result<usize> {
        let schedules = self.repo.load_active_view_schedules().await?;
        let count = schedules.len();
        for schedule in schedules {
            self.register(schedule.id);
        }
        info!("Resumed {} view schedules", count);
        Ok(count)
    }

    pub fn register(self: &Arc<Self>, view_schedule_id: i64) {
        if self.ticks.contains_key(&view_schedule_id) {
            return;
        }
        let scheduler = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let wait = match scheduler.tick(view_schedule_id).await {
                    Ok(Some(interval_ms)) => Duration::from_millis(interval_ms as u64),
                    Ok(None) => {
                        info!("View schedule {} no longer active, loop ends", view_schedule_id);
                        break;
                    }
                    Err(e) => {
                        error!("View schedule {} tick failed: {}", view_schedule_id, e);
                        Duration::from_secs(60)
                    }
                };
                tokio::time::sleep(wait).await;
            }
        });
        self.ticks.insert(view_schedule_id, handle);
    }

    pub fn unregister(&self, view_schedule_id: i64) {
        if let Some((_, handle)) = self.ticks.remove(&view_schedule_id) {
            handle.abort();
        }
    }

    pub fn stop(&self) {
        for entry in self.ticks.iter() {
            entry.value().abort();
        }
        self.ticks.clear();
    }

    /// One tick: stagger every target across the interval. Returns the
    /// interval for the next tick, or `None` when the schedule stopped.
    async fn tick(&self, view_schedule_id: i64) -> Result<Option<i64>> {
        let schedule = match self.repo.load_view_schedule(view_schedule_id).await {
            Ok(schedule) => schedule,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        if schedule.status != ScheduleStatus::Active {
            return Ok(None);
        }

        // Wait out a persisted next_run_at after restart.
        let now = Utc::now();
        if let Some(next) = schedule.next_run_at {
            if next > now {
                return Ok(Some((next - now).num_milliseconds()));
            }
        }

        let tick_key = format!("view_tick:{}:{}", schedule.id, now.timestamp() / 60);
        if !self
            .cache
            .set_nx(&tick_key, b"1", Some(Duration::from_secs(65)))
            .await
            .map_err(errors::Error::from)?
        {
            debug!("View schedule {} tick claimed elsewhere", schedule.id);
            return Ok(Some(schedule.interval_ms()));
        }

        let videos = schedule.videos();
        let interval_ms = schedule.interval_ms();
        for (index, video_id) in videos.iter().enumerate() {
            let delay = view_stagger_ms(interval_ms, videos.len(), index);
            self.queue
                .enqueue_simulate_view(
                    &SimulateViewJob::new(schedule.id, video_id.clone()),
                    Duration::from_millis(delay as u64),
                )
                .await?;
        }
        debug!(
            "View schedule {} staggered {} videos over {}ms",
            schedule.id,
            videos.len(),
            interval_ms
        );

        self.repo
            .persist_view_next_run(
                schedule.id,
                now + chrono::Duration::milliseconds(interval_ms),
            )
            .await?;
        Ok(Some(interval_ms))
    }
}

/// The `simulate-view` handler.
pub struct ViewWorker {
    repo: Arc<ScheduleRepository>,
    broker: Arc<Broker>,
    viewer: Arc<dyn ViewerService>,
}

impl ViewWorker {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        broker: Arc<Broker>,
        viewer: Arc<dyn ViewerService>,
    ) -> Self {
        Self {
            repo,
            broker,
            viewer,
        }
    }

    pub async fn handle(&self, job: SimulateViewJob) -> Result<()> {
        let schedule = match self.repo.load_view_schedule(job.view_schedule_id).await {
            Ok(schedule) => schedule,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if schedule.status != ScheduleStatus::Active {
            return Ok(());
        }

        // Probability is rolled at handler time, so a queued view can still
        // decide not to run.
        let roll = rand::thread_rng().gen_range(0..100);
        if roll >= schedule.probability.clamp(0, 100) {
            debug!(
                "View for {} skipped by probability roll ({} >= {})",
                job.video_id, roll, schedule.probability
            );
            return Ok(());
        }

        self.viewer
            .simulate(&job.video_id, schedule.min_watch_time, schedule.max_watch_time)
            .await?;

        if schedule.auto_like {
            // Server-side like is the reliable path; it rides a random
            // active account of the same user, on that account's proxy so
            // both actions share one egress.
            if let Err(e) = self.like_with_random_account(&schedule, &job.video_id).await {
                warn!("Auto-like for {} failed: {}", job.video_id, e);
            }
        }
        Ok(())
    }

    async fn like_with_random_account(
        &self,
        schedule: &ViewScheduleModel,
        video_id: &str,
    ) -> Result<()> {
        let accounts = self.repo.active_accounts_of_user(schedule.user_id).await?;
        let Some(account) = accounts.choose(&mut rand::thread_rng()).cloned() else {
            debug!("No active account available for auto-like");
            return Ok(());
        };

        let token = self.broker.ensure_fresh_token(&account).await?;
        let transport = self.broker.build_transport(&account).await?;
        self.broker
            .platform()
            .rate_video_like(&transport, &token, video_id)
            .await?;
        info!("Auto-liked {} with account {}", video_id, account.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_stagger_spreads_videos_across_interval() {
        // 3 videos over 6 minutes: 0, 2, 4 minutes in.
        let interval = 6 * 60_000;
        assert_eq!(view_stagger_ms(interval, 3, 0), 0);
        assert_eq!(view_stagger_ms(interval, 3, 1), 120_000);
        assert_eq!(view_stagger_ms(interval, 3, 2), 240_000);
    }

    #[test]
    fn view_stagger_empty_list_is_zero() {
        assert_eq!(view_stagger_ms(60_000, 0, 0), 0);
    }
}
