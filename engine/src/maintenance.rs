use crate::driver::ScheduleDriver;
use crate::repository::ScheduleRepository;
use crate::selector::AccountSelector;
use chrono::Utc;
use chrono_tz::Tz;
use common::model::entity::schedule::ScheduleStatus;
use common::model::message::TopicType;
use errors::Result;
use log::{error, info, warn};
use queue::QueueManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10 * 60);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Schedule id encoded in a processing job id (`interval-7-...`,
/// `once-7`, `immediate-7`, `cron-7-...`).
pub fn schedule_id_of_job(job_id: &str) -> Option<i64> {
    let rest = job_id
        .strip_prefix("interval-")
        .or_else(|| job_id.strip_prefix("once-"))
        .or_else(|| job_id.strip_prefix("immediate-"))
        .or_else(|| job_id.strip_prefix("cron-"))?;
    rest.split('-').next()?.parse().ok()
}

/// Background reconciliation: orphaned jobs, drifted counters, and the
/// daily quota amnesty.
pub struct Maintenance {
    repo: Arc<ScheduleRepository>,
    queue: Arc<QueueManager>,
    driver: Arc<ScheduleDriver>,
    selector: Arc<AccountSelector>,
    quota_tz: Tz,
}

impl Maintenance {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        queue: Arc<QueueManager>,
        driver: Arc<ScheduleDriver>,
        selector: Arc<AccountSelector>,
        quota_tz: Tz,
    ) -> Arc<Self> {
        Arc::new(Self {
            repo,
            queue,
            driver,
            selector,
            quota_tz,
        })
    }

    pub fn spawn_all(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) {
        self.clone().spawn_maintenance_loop(shutdown.subscribe());
        self.clone().spawn_reconcile_loop(shutdown.subscribe());
        self.clone().spawn_daily_reset_loop(shutdown.subscribe());
    }

    fn spawn_maintenance_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_maintenance().await {
                            error!("Maintenance pass failed: {}", e);
                        }
                    }
                }
            }
            info!("Maintenance loop stopped");
        });
    }

    async fn run_maintenance(&self) -> Result<()> {
        self.queue.clean_storage().await?;
        self.sweep_orphan_jobs().await?;
        self.sweep_orphan_crons().await?;
        self.selector.compact_usage();
        Ok(())
    }

    /// Delayed processing jobs whose schedule is gone or no longer active
    /// are dropped; active chains are left alone.
    async fn sweep_orphan_jobs(&self) -> Result<()> {
        let parked = self
            .queue
            .scheduled_jobs(TopicType::ScheduleProcessing)
            .await?;
        for envelope in parked {
            let Some(schedule_id) = schedule_id_of_job(&envelope.id) else {
                continue;
            };
            let keep = match self.repo.load_schedule(schedule_id).await {
                Ok(schedule) => schedule.status == ScheduleStatus::Active,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if !keep {
                warn!("Removing orphan job {} (schedule {})", envelope.id, schedule_id);
                self.queue
                    .remove_delayed(TopicType::ScheduleProcessing, &envelope.id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn sweep_orphan_crons(&self) -> Result<()> {
        for schedule_id in self.driver.registered_cron_ids() {
            let keep = match self.repo.load_schedule(schedule_id).await {
                Ok(schedule) => schedule.status == ScheduleStatus::Active,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            if !keep {
                self.driver.unregister_cron(schedule_id);
            }
        }
        Ok(())
    }

    fn spawn_reconcile_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reconcile_counters().await {
                            error!("Counter reconciliation failed: {}", e);
                        }
                    }
                }
            }
            info!("Reconciliation loop stopped");
        });
    }

    /// Progress counters drift under partial failures; the comment rows are
    /// the ground truth and win.
    async fn reconcile_counters(&self) -> Result<()> {
        for schedule in self.repo.load_active_schedules().await? {
            let (total, posted, failed, _pending) =
                self.repo.comment_status_counts(schedule.id).await?;
            if schedule.total_comments != total
                || schedule.posted_comments != posted
                || schedule.failed_comments != failed
            {
                info!(
                    "Reconciling schedule {}: {}/{}/{} -> {}/{}/{}",
                    schedule.id,
                    schedule.total_comments,
                    schedule.posted_comments,
                    schedule.failed_comments,
                    total,
                    posted,
                    failed
                );
                self.repo
                    .set_schedule_counters(schedule.id, total, posted, failed)
                    .await?;
            }
        }
        Ok(())
    }

    fn spawn_daily_reset_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            loop {
                let wait = utils::date::until_next_local_midnight(self.quota_tz, Utc::now());
                info!(
                    "Next daily quota reset in {}s ({})",
                    wait.as_secs(),
                    self.quota_tz
                );
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = tokio::time::sleep(wait) => {
                        if let Err(e) = self.run_daily_reset().await {
                            error!("Daily reset failed: {}", e);
                        }
                    }
                }
            }
            info!("Daily reset loop stopped");
        });
    }

    /// Midnight amnesty: quota counters to zero, sidelined accounts back to
    /// active, and error/review schedules resume. `paused` and `completed`
    /// are operator decisions and stay put.
    async fn run_daily_reset(&self) -> Result<()> {
        let profiles = self.repo.reset_all_profiles().await?;
        let accounts = self.repo.reset_sidelined_accounts().await?;
        let restored = self.repo.reset_errored_schedules().await?;
        info!(
            "Daily reset: {} profiles, {} accounts, {} schedules restored",
            profiles,
            accounts,
            restored.len()
        );

        for schedule_id in restored {
            if let Err(e) = self.driver.setup_schedule_job(schedule_id).await {
                warn!("Could not re-arm restored schedule {}: {}", schedule_id, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_parsing_covers_all_chain_shapes() {
        assert_eq!(schedule_id_of_job("interval-42-1718000000000"), Some(42));
        assert_eq!(schedule_id_of_job("once-7"), Some(7));
        assert_eq!(schedule_id_of_job("immediate-19"), Some(19));
        assert_eq!(schedule_id_of_job("cron-3-1718000000"), Some(3));
        assert_eq!(schedule_id_of_job("post-comment-9"), None);
        assert_eq!(schedule_id_of_job("garbage"), None);
    }
}
