use crate::broker::Broker;
use crate::repository::ScheduleRepository;
use crate::sanitize::sanitize_content;
use cacheable::CacheService;
use chrono_tz::Tz;
use common::model::entity::{AccountModel, AccountStatus, CommentModel, CommentStatus};
use common::model::message::PostCommentJob;
use errors::Result;
use log::{debug, info, warn};
use metrics::counter;
use std::sync::Arc;

/// One `commentThreads.insert` costs this many quota units upstream.
const INSERT_QUOTA_UNITS: i64 = 50;

/// The `post-comment` handler: one job, one upstream attempt, one
/// classified outcome.
pub struct PostWorker {
    repo: Arc<ScheduleRepository>,
    broker: Arc<Broker>,
    cache: Arc<CacheService>,
    quota_tz: Tz,
}

impl PostWorker {
    pub fn new(
        repo: Arc<ScheduleRepository>,
        broker: Arc<Broker>,
        cache: Arc<CacheService>,
        quota_tz: Tz,
    ) -> Self {
        Self {
            repo,
            broker,
            cache,
            quota_tz,
        }
    }

    pub async fn handle(&self, job: PostCommentJob) -> Result<()> {
        let comment = match self.repo.load_comment(job.comment_id).await {
            Ok(comment) => comment,
            Err(e) if e.is_not_found() => {
                warn!("Comment {} vanished before posting", job.comment_id);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Redelivery guard: only a pending row can be claimed. A second
        // delivery of the same job sees `scheduled`/`posted` and walks away.
        if comment.status != CommentStatus::Pending
            || !self.repo.claim_comment_for_posting(comment.id).await?
        {
            debug!(
                "Comment {} already {:?}, skipping duplicate delivery",
                comment.id, comment.status
            );
            return Ok(());
        }

        let result = self.attempt(&comment).await;
        if result.is_err() {
            // Transient failure: release the claim so the queue retry can
            // take it again. Terminal classes were already marked failed
            // and this is a no-op for them.
            let _ = self.repo.revert_comment_to_pending(comment.id).await;
        }
        result
    }

    async fn attempt(&self, comment: &CommentModel) -> Result<()> {
        let account = self.repo.load_account(comment.account_id).await?;
        if account.status != AccountStatus::Active {
            self.fail_comment(comment, "account is not active").await?;
            return Ok(());
        }

        // Token refresh. A refusal is terminal for the account.
        let access_token = match self.broker.ensure_fresh_token(&account).await {
            Ok(token) => token,
            Err(e) if e.is_token() => {
                warn!("Account {} token refresh failed: {}", account.id, e);
                self.repo
                    .set_account_status(
                        account.id,
                        AccountStatus::Inactive,
                        Some(format!("token refresh failed: {e}")),
                    )
                    .await?;
                self.fail_comment(comment, &format!("token refresh failed: {e}"))
                    .await?;
                return Ok(());
            }
            Err(e) => return self.classify_failure(comment, &account, e).await,
        };

        let transport = match self.broker.build_transport(&account).await {
            Ok(transport) => transport,
            Err(e) => return self.classify_failure(comment, &account, e).await,
        };

        let schedule = self.repo.load_schedule(comment.schedule_id).await.ok();
        let include_emojis = schedule.as_ref().map(|s| s.include_emojis).unwrap_or(false);
        let content = sanitize_content(&comment.content, include_emojis, &mut rand::thread_rng());

        let outcome = self
            .broker
            .platform()
            .insert_comment(
                &transport,
                &access_token,
                &comment.video_id,
                &content,
                comment.parent_id.as_deref(),
            )
            .await;

        match outcome {
            Ok(external_id) => self.record_success(comment, &account, &external_id).await,
            Err(e) => self.classify_failure(comment, &account, e).await,
        }
    }

    async fn record_success(
        &self,
        comment: &CommentModel,
        account: &AccountModel,
        external_id: &str,
    ) -> Result<()> {
        info!(
            "Comment {} posted as {} by account {}",
            comment.id, external_id, account.id
        );
        counter!("comments_posted_total").increment(1);

        self.repo.mark_comment_posted(comment.id, external_id).await?;

        let today = utils::date::today_in_tz(self.quota_tz, chrono::Utc::now());
        self.repo.record_account_success(account, today).await?;

        if let Some(profile_id) = account.api_profile_id {
            self.repo
                .add_profile_quota(profile_id, INSERT_QUOTA_UNITS)
                .await?;
        }

        self.repo
            .add_schedule_counters(comment.schedule_id, 0, 1, 0)
            .await?;
        self.invalidate_schedule(comment.schedule_id).await;
        Ok(())
    }

    /// The §outcome table: quota, proxy, duplicate, then everything else.
    /// Transient transport-level errors are the one path that propagates,
    /// handing the retry to the queue after the row reverts to pending.
    async fn classify_failure(
        &self,
        comment: &CommentModel,
        account: &AccountModel,
        err: errors::Error,
    ) -> Result<()> {
        if err.is_quota_exceeded() {
            warn!(
                "Quota exceeded for account {} (profile {:?})",
                account.id, account.api_profile_id
            );
            counter!("comments_failed_total", "class" => "quota").increment(1);
            if let Some(profile_id) = account.api_profile_id {
                self.repo.mark_profile_exceeded(profile_id).await?;
            }
            self.repo
                .set_account_status(
                    account.id,
                    AccountStatus::Limited,
                    Some("daily quota exceeded".to_string()),
                )
                .await?;
            self.fail_comment(comment, "quotaExceeded").await?;
            return Ok(());
        }

        if err.is_proxy() {
            let streak = self.repo.record_proxy_error(account).await?;
            warn!(
                "Proxy failure for account {} ({}/{}), rotating proxy",
                account.id, streak, account.proxy_error_threshold
            );
            counter!("comments_failed_total", "class" => "proxy").increment(1);
            self.broker.rotate_account_proxy(account).await?;
            self.fail_comment(comment, &format!("proxy error: {err}"))
                .await?;
            return Ok(());
        }

        if err.is_duplicate() {
            debug!(
                "Duplicate refusal for comment {} on account {}",
                comment.id, account.id
            );
            counter!("comments_failed_total", "class" => "duplicate").increment(1);
            self.repo.record_duplication(account.id).await?;
            self.fail_comment(comment, "rejected as duplicate").await?;
            return Ok(());
        }

        if err.is_transient() {
            // Propagate; the queue's backoff owns the next attempt and the
            // caller releases the row claim.
            return Err(err);
        }

        counter!("comments_failed_total", "class" => "other").increment(1);
        self.repo
            .set_account_status(
                account.id,
                AccountStatus::Inactive,
                Some(format!("posting failed: {err}")),
            )
            .await?;
        self.fail_comment(comment, &err.to_string()).await?;
        Ok(())
    }

    async fn fail_comment(&self, comment: &CommentModel, reason: &str) -> Result<()> {
        self.repo.mark_comment_failed(comment.id, reason).await?;
        self.repo
            .add_schedule_counters(comment.schedule_id, 0, 0, 1)
            .await?;
        self.invalidate_schedule(comment.schedule_id).await;
        Ok(())
    }

    async fn invalidate_schedule(&self, schedule_id: i64) {
        let _ = self.cache.del(&format!("schedule:{}", schedule_id)).await;
    }
}
