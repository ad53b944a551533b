use crate::generator::CommentGenerator;
use crate::selector::AccountSelector;
use crate::repository::ScheduleRepository;
use cacheable::CacheService;
use chrono::{DateTime, Utc};
use common::model::entity::{AccountModel, ScheduleModel, TargetVideo};
use common::model::message::PostCommentJob;
use errors::Result;
use log::{debug, info, warn};
use queue::QueueManager;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;

/// Row-creation loop cap; a batch that cannot finish in this window goes
/// out with whatever it has.
const DISPATCH_CEILING: Duration = Duration::from_secs(30);

/// Strict stagger anchored to the batch start, so per-comment generation
/// time cannot accumulate into drift.
pub fn dispatch_delay_ms(
    batch_start: DateTime<Utc>,
    index: usize,
    stagger_ms: i64,
    now: DateTime<Utc>,
) -> i64 {
    let target = batch_start + chrono::Duration::milliseconds(index as i64 * stagger_ms);
    (target - now).num_milliseconds().max(0)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub created: usize,
    pub skipped: usize,
}

/// Turns one schedule tick into comment rows plus staggered post jobs.
pub struct BatchDispatcher {
    repo: Arc<ScheduleRepository>,
    queue: Arc<QueueManager>,
    cache: Arc<CacheService>,
    selector: Arc<AccountSelector>,
    generator: Arc<CommentGenerator>,
}

impl BatchDispatcher {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        queue: Arc<QueueManager>,
        cache: Arc<CacheService>,
        selector: Arc<AccountSelector>,
        generator: Arc<CommentGenerator>,
    ) -> Self {
        Self {
            repo,
            queue,
            cache,
            selector,
            generator,
        }
    }

    pub async fn dispatch(
        &self,
        schedule: &ScheduleModel,
        accounts: &[AccountModel],
        metadata_api_key: Option<&str>,
    ) -> Result<BatchStats> {
        let videos = schedule.videos();
        if videos.is_empty() {
            return Err(errors::ScheduleError::NoTargets.into());
        }

        let batch_start = Utc::now();
        let stagger_ms = schedule.stagger_ms();
        let mut stats = BatchStats::default();
        let mut remaining: Vec<&AccountModel> = accounts.iter().collect();

        for index in 0..accounts.len() {
            if (Utc::now() - batch_start).num_milliseconds() as u128
                > DISPATCH_CEILING.as_millis()
            {
                warn!(
                    "Schedule {} hit the dispatch ceiling after {} rows, continuing with those",
                    schedule.id, stats.created
                );
                break;
            }
            if remaining.is_empty() {
                break;
            }

            let video = videos
                .choose(&mut rand::thread_rng())
                .expect("videos checked non-empty")
                .clone();

            let remaining_owned: Vec<AccountModel> =
                remaining.iter().map(|a| (*a).clone()).collect();
            let account = match self
                .selector
                .select(schedule, &remaining_owned, &video.video_id)
                .await
            {
                Ok(account) => account.clone(),
                Err(e) => {
                    warn!("Schedule {} selection failed: {}", schedule.id, e);
                    break;
                }
            };
            remaining.retain(|a| a.id != account.id);

            match self
                .dispatch_one(schedule, &account, &video, index, batch_start, stagger_ms,
                    metadata_api_key)
                .await
            {
                Ok(true) => stats.created += 1,
                Ok(false) => stats.skipped += 1,
                Err(e) => {
                    warn!(
                        "Schedule {} dispatch for account {} failed: {}",
                        schedule.id, account.id, e
                    );
                    stats.skipped += 1;
                }
            }
        }

        info!(
            "Schedule {} batch dispatched {} comments ({} skipped)",
            schedule.id, stats.created, stats.skipped
        );
        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_one(
        &self,
        schedule: &ScheduleModel,
        account: &AccountModel,
        video: &TargetVideo,
        index: usize,
        batch_start: DateTime<Utc>,
        stagger_ms: i64,
        metadata_api_key: Option<&str>,
    ) -> Result<bool> {
        // Micro-cooldown on the (account, video) pair; TTL equals the
        // stagger so contention can't double-dispatch the pair.
        let cooldown_key = format!("account:{}:video:{}:cooldown", account.id, video.video_id);
        let acquired = self
            .cache
            .set_nx(
                &cooldown_key,
                b"1",
                Some(Duration::from_millis(stagger_ms.max(1) as u64)),
            )
            .await
            .map_err(errors::Error::from)?;
        if !acquired {
            debug!(
                "Cooldown active for account {} on video {}, skipping",
                account.id, video.video_id
            );
            return Ok(false);
        }

        let content = self
            .generator
            .generate(schedule, video, metadata_api_key)
            .await?;

        let scheduled_for =
            batch_start + chrono::Duration::milliseconds(index as i64 * stagger_ms);
        let comment = self
            .repo
            .create_comment(
                schedule.user_id,
                schedule.id,
                account.id,
                &video.video_id,
                None,
                &content,
                scheduled_for,
                schedule.last_used_account_id,
            )
            .await?;
        self.repo.add_schedule_counters(schedule.id, 1, 0, 0).await?;

        let delay = dispatch_delay_ms(batch_start, index, stagger_ms, Utc::now());
        self.queue
            .enqueue_post_comment(
                &PostCommentJob::new(comment.id, schedule.id),
                Duration::from_millis(delay as u64),
            )
            .await?;

        self.selector
            .mark_dispatched(schedule.id, account.id, &video.video_id)
            .await?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stagger_is_anchored_to_batch_start() {
        let start = Utc::now();
        // No time has passed: i-th dispatch waits i * stagger.
        assert_eq!(dispatch_delay_ms(start, 0, 1_500, start), 0);
        assert_eq!(dispatch_delay_ms(start, 2, 1_500, start), 3_000);

        // Generation burned 2s: the third slot is only 1s away now.
        let later = start + chrono::Duration::seconds(2);
        assert_eq!(dispatch_delay_ms(start, 2, 1_500, later), 1_000);

        // Already past its slot: fire immediately, never negative.
        let much_later = start + chrono::Duration::seconds(10);
        assert_eq!(dispatch_delay_ms(start, 2, 1_500, much_later), 0);
    }
}
