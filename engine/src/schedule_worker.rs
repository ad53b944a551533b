use crate::dispatch::BatchDispatcher;
use crate::driver::{schedule_lock_ttl, ScheduleDriver};
use crate::repository::ScheduleRepository;
use crate::sleep::{SleepController, SleepOutcome};
use cacheable::CacheService;
use chrono::Utc;
use common::model::entity::schedule::ScheduleStatus;
use common::model::entity::{AccountModel, AccountSelection, AccountStatus, ScheduleKind, ScheduleModel};
use common::model::message::ProcessScheduleJob;
use errors::Result;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use utils::redis_lock::DistributedLockManager;

/// Consecutive handler failures tolerated before a schedule is pulled for
/// review; transient infra noise below this self-heals.
const ERROR_REVIEW_THRESHOLD: i32 = 50;

/// The `process-schedule` handler: one invocation = one batch.
pub struct ScheduleWorker {
    repo: Arc<ScheduleRepository>,
    driver: Arc<ScheduleDriver>,
    sleep: Arc<SleepController>,
    dispatcher: Arc<BatchDispatcher>,
    cache: Arc<CacheService>,
    locker: Arc<DistributedLockManager>,
}

impl ScheduleWorker {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        driver: Arc<ScheduleDriver>,
        sleep: Arc<SleepController>,
        dispatcher: Arc<BatchDispatcher>,
        cache: Arc<CacheService>,
        locker: Arc<DistributedLockManager>,
    ) -> Self {
        Self {
            repo,
            driver,
            sleep,
            dispatcher,
            cache,
            locker,
        }
    }

    /// Top-level entry. Handler failures are absorbed here: the error
    /// streak is recorded and the interval chain keeps firing, so this
    /// returns `Ok` to the queue either way.
    pub async fn handle(&self, job: ProcessScheduleJob) -> Result<()> {
        let schedule_id = job.schedule_id;
        match self.process(schedule_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("Schedule {} batch failed: {}", schedule_id, e);
                self.record_failure(schedule_id, &e).await;
                Ok(())
            }
        }
    }

    async fn record_failure(&self, schedule_id: i64, err: &errors::Error) {
        let count = match self
            .repo
            .increment_schedule_error(schedule_id, &err.to_string())
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!("Could not record failure for schedule {}: {}", schedule_id, e);
                return;
            }
        };

        if count >= ERROR_REVIEW_THRESHOLD {
            warn!(
                "Schedule {} crossed {} consecutive errors, flagging for review",
                schedule_id, count
            );
            let _ = self
                .repo
                .set_schedule_status(
                    schedule_id,
                    ScheduleStatus::RequiresReview,
                    Some(format!("{count} consecutive processing errors")),
                )
                .await;
            let _ = self.driver.drop_schedule_jobs(schedule_id).await;
            return;
        }

        // Below the threshold the chain must keep breathing.
        if let Ok(schedule) = self.repo.load_schedule(schedule_id).await {
            if matches!(schedule.kind(), ScheduleKind::Interval { .. })
                && schedule.status == ScheduleStatus::Active
            {
                let interval_ms = schedule.interval_spec().millis();
                if let Err(e) = self.driver.enqueue_follow_up(schedule_id, interval_ms, 0).await {
                    error!(
                        "Failed to re-arm schedule {} after error: {}",
                        schedule_id, e
                    );
                }
            }
        }
    }

    async fn process(&self, schedule_id: i64) -> Result<()> {
        let schedule = match self.repo.load_schedule(schedule_id).await {
            Ok(schedule) => schedule,
            Err(e) if e.is_not_found() => {
                // Deleted out from under the job; nothing to re-arm.
                warn!("Schedule {} vanished, dropping its jobs", schedule_id);
                self.driver.drop_schedule_jobs(schedule_id).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if schedule.status != ScheduleStatus::Active {
            debug!(
                "Schedule {} is {:?}, batch skipped and chain ends",
                schedule_id, schedule.status
            );
            return Ok(());
        }

        if let Some(end) = schedule.end_date {
            if end <= Utc::now() {
                info!("Schedule {} passed its end date, completing", schedule_id);
                self.repo
                    .set_schedule_status(schedule_id, ScheduleStatus::Completed, None)
                    .await?;
                self.driver.drop_schedule_jobs(schedule_id).await?;
                self.invalidate_cache(&schedule).await;
                return Ok(());
            }
        }

        // One batch per schedule at a time, cluster-wide. Lock TTL expires
        // before the next recursive job can fire.
        let interval_secs = (schedule.interval_spec().millis() / 1000).max(1) as u64;
        let lock_name = format!("schedule_processing:{}", schedule_id);
        let ttl = Duration::from_secs(schedule_lock_ttl(interval_secs));
        if !self.locker.try_acquire(&lock_name, ttl).await.map_err(|e| {
            errors::Error::with_message(
                errors::ErrorKind::Cache,
                "schedule lock".to_string(),
                Some(Box::new(e) as errors::BoxError),
            )
        })? {
            debug!(
                "Schedule {} already being processed elsewhere, skipping",
                schedule_id
            );
            return Ok(());
        }

        let result = self.run_batch(&schedule).await;

        if let Err(e) = self.locker.release(&lock_name).await {
            warn!("Failed to release lock for schedule {}: {}", schedule_id, e);
        }
        result
    }

    async fn run_batch(&self, schedule: &ScheduleModel) -> Result<()> {
        let batch_start = Utc::now();
        let is_interval = matches!(schedule.kind(), ScheduleKind::Interval { .. });

        let (outcome, schedule) = self.sleep.evaluate(schedule).await?;
        let interval_ms = match outcome {
            SleepOutcome::Sleeping { remaining_ms } => {
                if is_interval {
                    self.driver
                        .enqueue_follow_up(schedule.id, remaining_ms, 0)
                        .await?;
                }
                return Ok(());
            }
            SleepOutcome::EnteredSleep { sleep_ms } => {
                // The sleep window is the effective interval; no posting
                // until it ends.
                if is_interval {
                    self.driver.enqueue_follow_up(schedule.id, sleep_ms, 0).await?;
                }
                self.invalidate_cache(&schedule).await;
                return Ok(());
            }
            SleepOutcome::Run { interval_ms } => interval_ms,
        };

        // Config sanity: these need operator action, not retries.
        if schedule.videos().is_empty() {
            self.repo
                .set_schedule_status(
                    schedule.id,
                    ScheduleStatus::RequiresReview,
                    Some("no target videos configured".to_string()),
                )
                .await?;
            self.driver.drop_schedule_jobs(schedule.id).await?;
            return Ok(());
        }
        if !schedule.use_ai && schedule.templates().is_empty() {
            self.repo
                .set_schedule_status(
                    schedule.id,
                    ScheduleStatus::RequiresReview,
                    Some("no comment templates configured".to_string()),
                )
                .await?;
            self.driver.drop_schedule_jobs(schedule.id).await?;
            return Ok(());
        }

        let (accounts, metadata_api_key) = self.eligible_accounts(&schedule).await?;
        if accounts.is_empty() {
            // Limited/inactive accounts come back at the daily reset; the
            // chain keeps running rather than parking the schedule.
            warn!(
                "Schedule {} has no eligible accounts this batch",
                schedule.id
            );
        } else {
            self.dispatcher
                .dispatch(&schedule, &accounts, metadata_api_key.as_deref())
                .await?;
        }

        if is_interval {
            let elapsed_ms = (Utc::now() - batch_start).num_milliseconds();
            self.driver
                .enqueue_follow_up(schedule.id, interval_ms, elapsed_ms)
                .await?;
        } else {
            self.repo.persist_next_run_at(schedule.id, None).await?;
        }

        self.invalidate_cache(&schedule).await;
        Ok(())
    }

    /// Active accounts eligible under the schedule's selection mode, with
    /// the quota hard-stop applied per bound profile. Also surfaces an API
    /// key usable for metadata lookups.
    async fn eligible_accounts(
        &self,
        schedule: &ScheduleModel,
    ) -> Result<(Vec<AccountModel>, Option<String>)> {
        let accounts = match schedule.account_selection {
            AccountSelection::Specific | AccountSelection::RoundRobin => {
                let ids = self.repo.selected_account_ids(schedule.id).await?;
                self.repo.load_accounts(&ids).await?
            }
            AccountSelection::Random => {
                self.repo.active_accounts_of_user(schedule.user_id).await?
            }
        };

        let mut profiles: HashMap<i64, bool> = HashMap::new();
        let mut metadata_api_key = None;
        let mut eligible = Vec::new();

        for account in accounts {
            if account.status != AccountStatus::Active {
                continue;
            }
            if let Some(profile_id) = account.api_profile_id {
                let allowed = match profiles.get(&profile_id) {
                    Some(allowed) => *allowed,
                    None => {
                        let allowed = match self.repo.load_api_profile(profile_id).await? {
                            Some(profile) => {
                                if metadata_api_key.is_none() {
                                    metadata_api_key = profile.api_key.clone();
                                }
                                profile.limit_quota <= 0
                                    || profile.used_quota < profile.limit_quota
                            }
                            None => false,
                        };
                        profiles.insert(profile_id, allowed);
                        allowed
                    }
                };
                if !allowed {
                    debug!(
                        "Account {} skipped, profile {} out of quota",
                        account.id, profile_id
                    );
                    continue;
                }
            }
            eligible.push(account);
        }

        Ok((eligible, metadata_api_key))
    }

    async fn invalidate_cache(&self, schedule: &ScheduleModel) {
        let _ = self.cache.del(&format!("schedule:{}", schedule.id)).await;
        let _ = self
            .cache
            .del_pattern(&format!("user:{}:schedules:*", schedule.user_id))
            .await;
    }
}
