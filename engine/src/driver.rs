use crate::repository::ScheduleRepository;
use cacheable::CacheService;
use chrono::{DateTime, TimeZone, Utc};
use common::model::entity::schedule::ScheduleStatus;
use common::model::entity::{ScheduleKind, ScheduleModel};
use common::model::message::{ProcessScheduleJob, TopicType};
use cron::Schedule as CronSchedule;
use dashmap::DashMap;
use errors::{Result, ScheduleError};
use log::{debug, error, info, warn};
use queue::QueueManager;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Lock TTL sized so a crashed holder's lock is gone before the next
/// recursive job fires, while a healthy batch never overlaps itself.
pub fn schedule_lock_ttl(interval_secs: u64) -> u64 {
    ((interval_secs as f64 * 0.9) as u64).clamp(10, 3600)
}

/// Delay until an interval schedule's next tick, plus whether the computed
/// `next_run_at` must be persisted (first-ever run draws a full interval so
/// a brand-new schedule doesn't fire instantly and then drift).
pub fn interval_start_delay(
    now: DateTime<Utc>,
    next_run_at: Option<DateTime<Utc>>,
    start_date: Option<DateTime<Utc>>,
    posted_comments: i64,
    interval_ms: i64,
) -> (i64, bool) {
    if let Some(next) = next_run_at {
        if next > now {
            return ((next - now).num_milliseconds(), false);
        }
    }
    if let Some(start) = start_date {
        if start > now {
            return ((start - now).num_milliseconds(), false);
        }
    }
    if posted_comments == 0 {
        return (interval_ms, true);
    }
    (0, false)
}

/// The recursive-delay step: the follow-up waits out whatever is left of
/// the interval after the batch's own wall time, floored at one second.
pub fn follow_up_delay(interval_ms: i64, batch_elapsed_ms: i64) -> i64 {
    (interval_ms - batch_elapsed_ms).max(1_000)
}

pub fn interval_job_id(schedule_id: i64, now: DateTime<Utc>) -> String {
    format!("interval-{}-{}", schedule_id, now.timestamp_millis())
}

/// Translates schedules into queue jobs. Owns the cron registry; its
/// lifecycle is tied to `stop`, never to process-wide statics.
pub struct ScheduleDriver {
    repo: Arc<ScheduleRepository>,
    queue: Arc<QueueManager>,
    cache: Arc<CacheService>,
    cron_tasks: DashMap<i64, tokio::task::JoinHandle<()>>,
}

impl ScheduleDriver {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        queue: Arc<QueueManager>,
        cache: Arc<CacheService>,
    ) -> Self {
        Self {
            repo,
            queue,
            cache,
            cron_tasks: DashMap::new(),
        }
    }

    /// Materialises the schedule's next job. Idempotent: job-id dedup means
    /// calling this twice cannot start a second chain.
    pub async fn setup_schedule_job(self: &Arc<Self>, schedule_id: i64) -> Result<()> {
        let schedule = self.repo.load_schedule(schedule_id).await?;

        if schedule.status != ScheduleStatus::Active {
            debug!(
                "Schedule {} is not active, dropping any cron registration",
                schedule_id
            );
            self.unregister_cron(schedule_id);
            return Ok(());
        }

        // Mid-sleep there is already exactly one follow-up job outstanding.
        if schedule.in_sleep_window(Utc::now()) {
            debug!("Schedule {} is sleeping, not enqueuing", schedule_id);
            return Ok(());
        }

        let job = ProcessScheduleJob::new(schedule_id);
        match schedule.kind() {
            ScheduleKind::Immediate => {
                self.queue
                    .enqueue_process_schedule(
                        &job,
                        format!("immediate-{}", schedule_id),
                        Duration::ZERO,
                    )
                    .await?;
            }
            ScheduleKind::Once { at } => {
                let delay = at
                    .map(|start| (start - Utc::now()).num_milliseconds().max(0))
                    .unwrap_or(0);
                self.queue
                    .enqueue_process_schedule(
                        &job,
                        format!("once-{}", schedule_id),
                        Duration::from_millis(delay as u64),
                    )
                    .await?;
            }
            ScheduleKind::Cron { expression } => {
                self.register_cron(&schedule, &expression)?;
            }
            ScheduleKind::Interval { spec } => {
                // The queue is durable: after a restart the previous
                // follow-up is usually still parked. Epoch-suffixed job
                // ids defeat dedup here, so check for a live chain first.
                let prefix = format!("interval-{}-", schedule_id);
                let chain_alive = self
                    .queue
                    .scheduled_jobs(TopicType::ScheduleProcessing)
                    .await?
                    .iter()
                    .any(|envelope| envelope.id.starts_with(&prefix));
                if chain_alive {
                    debug!(
                        "Schedule {} interval chain already armed, skipping",
                        schedule_id
                    );
                    return Ok(());
                }

                let now = Utc::now();
                let (delay_ms, persist) = interval_start_delay(
                    now,
                    schedule.next_run_at,
                    schedule.start_date,
                    schedule.posted_comments,
                    spec.millis(),
                );
                if persist {
                    self.repo
                        .persist_next_run_at(
                            schedule_id,
                            Some(now + chrono::Duration::milliseconds(delay_ms)),
                        )
                        .await?;
                }
                let enqueued = self
                    .queue
                    .enqueue_process_schedule(
                        &job,
                        interval_job_id(schedule_id, now),
                        Duration::from_millis(delay_ms as u64),
                    )
                    .await?;
                if enqueued {
                    info!(
                        "Schedule {} interval chain armed, first tick in {}ms",
                        schedule_id, delay_ms
                    );
                }
            }
        }
        Ok(())
    }

    /// Enqueues exactly one follow-up for an interval batch and persists
    /// the new `next_run_at` so a restart resumes from it.
    pub async fn enqueue_follow_up(
        &self,
        schedule_id: i64,
        interval_ms: i64,
        batch_elapsed_ms: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let delay_ms = follow_up_delay(interval_ms, batch_elapsed_ms);
        let next_run_at = now + chrono::Duration::milliseconds(delay_ms);

        self.repo
            .persist_next_run_at(schedule_id, Some(next_run_at))
            .await?;
        self.queue
            .enqueue_process_schedule(
                &ProcessScheduleJob::new(schedule_id),
                interval_job_id(schedule_id, now),
                Duration::from_millis(delay_ms as u64),
            )
            .await?;
        debug!(
            "Schedule {} follow-up in {}ms (interval {}ms, batch took {}ms)",
            schedule_id, delay_ms, interval_ms, batch_elapsed_ms
        );
        Ok(())
    }

    /// One cron loop per recurring schedule, ticking on minute boundaries.
    /// A short-TTL `SET NX` per firing keeps multi-node deployments to one
    /// enqueue per minute.
    fn register_cron(self: &Arc<Self>, schedule: &ScheduleModel, expression: &str) -> Result<()> {
        if self.cron_tasks.contains_key(&schedule.id) {
            return Ok(());
        }
        let cron = CronSchedule::from_str(expression)
            .map_err(|e| ScheduleError::InvalidCron(format!("{expression}: {e}")))?;

        let schedule_id = schedule.id;
        let driver = self.clone();
        let handle = tokio::spawn(async move {
            info!("Cron loop started for schedule {}", schedule_id);
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;

                let now = Utc::now();
                let Some(current_minute) =
                    Utc.timestamp_opt(now.timestamp() / 60 * 60, 0).single()
                else {
                    continue;
                };

                if !cron_matches(&cron, current_minute) {
                    continue;
                }

                let lock_key = format!("cron:{}:{}", schedule_id, current_minute.timestamp());
                match driver
                    .cache
                    .set_nx(&lock_key, b"1", Some(Duration::from_secs(65)))
                    .await
                {
                    Ok(true) => {
                        info!(
                            "Cron firing for schedule {} at {}",
                            schedule_id, current_minute
                        );
                        let job = ProcessScheduleJob::new(schedule_id);
                        let job_id =
                            format!("cron-{}-{}", schedule_id, current_minute.timestamp());
                        if let Err(e) = driver
                            .queue
                            .enqueue_process_schedule(&job, job_id, Duration::ZERO)
                            .await
                        {
                            error!("Cron enqueue failed for schedule {}: {}", schedule_id, e);
                        }
                    }
                    Ok(false) => {
                        debug!("Cron firing for schedule {} already claimed", schedule_id);
                    }
                    Err(e) => error!("Cron lock failed for schedule {}: {}", schedule_id, e),
                }
            }
        });
        self.cron_tasks.insert(schedule_id, handle);
        Ok(())
    }

    pub fn unregister_cron(&self, schedule_id: i64) {
        if let Some((_, handle)) = self.cron_tasks.remove(&schedule_id) {
            handle.abort();
            info!("Cron loop stopped for schedule {}", schedule_id);
        }
    }

    /// Drops everything outstanding for a schedule: the cron loop and any
    /// parked delayed jobs. Used on pause/complete/delete and by the
    /// orphan sweep.
    pub async fn drop_schedule_jobs(&self, schedule_id: i64) -> Result<()> {
        self.unregister_cron(schedule_id);

        let prefix = format!("interval-{}-", schedule_id);
        let singles = [
            format!("immediate-{}", schedule_id),
            format!("once-{}", schedule_id),
        ];
        for envelope in self
            .queue
            .scheduled_jobs(TopicType::ScheduleProcessing)
            .await?
        {
            if envelope.id.starts_with(&prefix) || singles.contains(&envelope.id) {
                self.queue
                    .remove_delayed(TopicType::ScheduleProcessing, &envelope.id)
                    .await?;
                info!("Removed parked job {} for schedule {}", envelope.id, schedule_id);
            }
        }
        Ok(())
    }

    /// Restart resume: re-materialise every active schedule. Interval
    /// chains pick up from their persisted `next_run_at`.
    pub async fn resume_active(self: &Arc<Self>) -> Result<usize> {
        let schedules = self.repo.load_active_schedules().await?;
        let count = schedules.len();
        for schedule in schedules {
            if let Err(e) = self.setup_schedule_job(schedule.id).await {
                warn!("Failed to resume schedule {}: {}", schedule.id, e);
            }
        }
        info!("Resumed {} active schedules", count);
        Ok(count)
    }

    pub fn stop(&self) {
        for entry in self.cron_tasks.iter() {
            entry.value().abort();
        }
        self.cron_tasks.clear();
    }

    pub fn registered_cron_ids(&self) -> Vec<i64> {
        self.cron_tasks.iter().map(|e| *e.key()).collect()
    }
}

fn cron_matches(schedule: &CronSchedule, target: DateTime<Utc>) -> bool {
    // A minute matches when the first occurrence after (target - 1s) is
    // the target itself.
    let check_from = target - chrono::Duration::seconds(1);
    schedule
        .after(&check_from)
        .next()
        .map(|next| next == target)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ttl_is_clamped_and_scaled() {
        assert_eq!(schedule_lock_ttl(5), 10); // floor
        assert_eq!(schedule_lock_ttl(100), 90); // 0.9x
        assert_eq!(schedule_lock_ttl(100_000), 3600); // ceiling
    }

    #[test]
    fn interval_delay_prefers_persisted_next_run() {
        let now = Utc::now();
        let (delay, persist) = interval_start_delay(
            now,
            Some(now + chrono::Duration::seconds(45)),
            None,
            10,
            120_000,
        );
        assert!((44_000..=45_000).contains(&delay));
        assert!(!persist);
    }

    #[test]
    fn interval_delay_uses_future_start_date() {
        let now = Utc::now();
        let (delay, persist) = interval_start_delay(
            now,
            None,
            Some(now + chrono::Duration::seconds(30)),
            5,
            120_000,
        );
        assert!((29_000..=30_000).contains(&delay));
        assert!(!persist);
    }

    #[test]
    fn fresh_schedule_waits_one_full_interval() {
        let now = Utc::now();
        let (delay, persist) = interval_start_delay(now, None, None, 0, 120_000);
        assert_eq!(delay, 120_000);
        assert!(persist);
    }

    #[test]
    fn warmed_schedule_fires_immediately() {
        let now = Utc::now();
        let (delay, persist) = interval_start_delay(
            now,
            Some(now - chrono::Duration::seconds(5)),
            None,
            3,
            120_000,
        );
        assert_eq!(delay, 0);
        assert!(!persist);
    }

    #[test]
    fn follow_up_absorbs_batch_time_with_floor() {
        assert_eq!(follow_up_delay(120_000, 20_000), 100_000);
        assert_eq!(follow_up_delay(120_000, 119_500), 1_000);
        assert_eq!(follow_up_delay(120_000, 500_000), 1_000);
    }

    #[test]
    fn cron_minute_matching() {
        let cron = CronSchedule::from_str("0 30 14 * * * *").unwrap();
        let hit = Utc.with_ymd_and_hms(2025, 6, 1, 14, 30, 0).unwrap();
        let miss = Utc.with_ymd_and_hms(2025, 6, 1, 14, 31, 0).unwrap();
        assert!(cron_matches(&cron, hit));
        assert!(!cron_matches(&cron, miss));
    }
}
