use chrono::{NaiveDate, Utc};
use common::model::entity::*;
use errors::{OrmError, Result};
use log::warn;
use rand::seq::SliceRandom;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait,
    QueryFilter, QuerySelect, TransactionTrait,
};
use std::sync::Arc;

use common::model::entity::schedule::ScheduleStatus;

/// Typed persistence gateway. Every engine component goes through here;
/// nothing else issues queries.
pub struct ScheduleRepository {
    db: Arc<DatabaseConnection>,
}

fn query_err(e: sea_orm::DbErr) -> errors::Error {
    OrmError::QueryExecutionError(e.to_string().into()).into()
}

fn txn_err(e: sea_orm::DbErr) -> errors::Error {
    OrmError::TransactionError(e.to_string().into()).into()
}

impl ScheduleRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    // ---- schedules ----

    pub async fn load_schedule(&self, id: i64) -> Result<ScheduleModel> {
        ScheduleEntity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(query_err)?
            .ok_or_else(|| OrmError::NotFound.into())
    }

    pub async fn load_active_schedules(&self) -> Result<Vec<ScheduleModel>> {
        ScheduleEntity::find()
            .filter(ScheduleColumn::Status.eq(ScheduleStatus::Active))
            .all(&*self.db)
            .await
            .map_err(query_err)
    }

    pub async fn set_schedule_status(
        &self,
        id: i64,
        status: ScheduleStatus,
        error_message: Option<String>,
    ) -> Result<()> {
        let mut update = ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::Status, Expr::value(status))
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()));
        if let Some(message) = error_message {
            update = update.col_expr(ScheduleColumn::ErrorMessage, Expr::value(message));
        }
        update
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Bumps the failure streak and returns the new count. The caller
    /// decides when the streak warrants `requires_review`.
    pub async fn increment_schedule_error(&self, id: i64, message: &str) -> Result<i32> {
        ScheduleEntity::update_many()
            .col_expr(
                ScheduleColumn::ErrorCount,
                Expr::col(ScheduleColumn::ErrorCount).add(1),
            )
            .col_expr(ScheduleColumn::ErrorMessage, Expr::value(message))
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;

        let schedule = self.load_schedule(id).await?;
        Ok(schedule.error_count)
    }

    pub async fn clear_schedule_error(&self, id: i64) -> Result<()> {
        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::ErrorCount, Expr::value(0))
            .col_expr(ScheduleColumn::ErrorMessage, Expr::value(Option::<String>::None))
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn persist_next_run_at(
        &self,
        id: i64,
        next_run_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::NextRunAt, Expr::value(next_run_at))
            .col_expr(ScheduleColumn::LastProcessedAt, Expr::value(Utc::now()))
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn persist_interval_value(&self, id: i64, value: i32) -> Result<()> {
        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::IntervalValue, Expr::value(value))
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn add_schedule_counters(
        &self,
        id: i64,
        total: i64,
        posted: i64,
        failed: i64,
    ) -> Result<()> {
        let mut update = ScheduleEntity::update_many();
        if total != 0 {
            update = update.col_expr(
                ScheduleColumn::TotalComments,
                Expr::col(ScheduleColumn::TotalComments).add(total),
            );
        }
        if posted != 0 {
            update = update.col_expr(
                ScheduleColumn::PostedComments,
                Expr::col(ScheduleColumn::PostedComments).add(posted),
            );
        }
        if failed != 0 {
            update = update.col_expr(
                ScheduleColumn::FailedComments,
                Expr::col(ScheduleColumn::FailedComments).add(failed),
            );
        }
        update
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn set_schedule_counters(
        &self,
        id: i64,
        total: i64,
        posted: i64,
        failed: i64,
    ) -> Result<()> {
        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::TotalComments, Expr::value(total))
            .col_expr(ScheduleColumn::PostedComments, Expr::value(posted))
            .col_expr(ScheduleColumn::FailedComments, Expr::value(failed))
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Grows the template pool with an AI-generated comment so later runs
    /// draw from a curated set. No-op when the text is already present.
    pub async fn append_comment_template(&self, schedule_id: i64, text: &str) -> Result<()> {
        let schedule = self.load_schedule(schedule_id).await?;
        let mut templates = schedule.templates();
        if templates.iter().any(|t| t == text) {
            return Ok(());
        }
        templates.push(text.to_string());
        ScheduleEntity::update_many()
            .col_expr(
                ScheduleColumn::CommentTemplates,
                Expr::value(serde_json::json!(templates)),
            )
            .filter(ScheduleColumn::Id.eq(schedule_id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn set_last_used_account(&self, schedule_id: i64, account_id: i64) -> Result<()> {
        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::LastUsedAccountId, Expr::value(account_id))
            .filter(ScheduleColumn::Id.eq(schedule_id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Records entry into a sleep window. `last_sleep_trigger_count` is the
    /// idempotency guard: it only moves forward, so re-checking the same
    /// posted-count cannot re-trigger.
    pub async fn persist_sleep_entry(
        &self,
        id: i64,
        sleep_minutes: i32,
        trigger_count: i64,
    ) -> Result<()> {
        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::SleepDelayMinutes, Expr::value(sleep_minutes))
            .col_expr(ScheduleColumn::SleepDelayStartTime, Expr::value(Utc::now()))
            .col_expr(ScheduleColumn::LastSleepTriggerCount, Expr::value(trigger_count))
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn clear_sleep(&self, id: i64, new_limit_value: Option<i32>) -> Result<()> {
        let mut update = ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::SleepDelayMinutes, Expr::value(0))
            .col_expr(
                ScheduleColumn::SleepDelayStartTime,
                Expr::value(Option::<chrono::DateTime<Utc>>::None),
            )
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()));
        if let Some(value) = new_limit_value {
            update = update.col_expr(ScheduleColumn::LimitValue, Expr::value(value));
        }
        update
            .filter(ScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Swaps the active account subset in one transaction: membership rows
    /// and the schedule's rotation bookkeeping move together.
    pub async fn persist_rotation(
        &self,
        schedule_id: i64,
        selected: &[i64],
        rotated_principal: &[i64],
        rotated_secondary: &[i64],
        currently_active: ActivePool,
    ) -> Result<()> {
        let txn = self.db.begin().await.map_err(txn_err)?;

        selected_account::Entity::delete_many()
            .filter(selected_account::Column::ScheduleId.eq(schedule_id))
            .exec(&txn)
            .await
            .map_err(txn_err)?;
        rotated_principal::Entity::delete_many()
            .filter(rotated_principal::Column::ScheduleId.eq(schedule_id))
            .exec(&txn)
            .await
            .map_err(txn_err)?;
        rotated_secondary::Entity::delete_many()
            .filter(rotated_secondary::Column::ScheduleId.eq(schedule_id))
            .exec(&txn)
            .await
            .map_err(txn_err)?;

        if !selected.is_empty() {
            selected_account::Entity::insert_many(selected.iter().map(|account_id| {
                selected_account::ActiveModel {
                    schedule_id: Set(schedule_id),
                    account_id: Set(*account_id),
                }
            }))
            .exec(&txn)
            .await
            .map_err(txn_err)?;
        }
        if !rotated_principal.is_empty() {
            rotated_principal::Entity::insert_many(rotated_principal.iter().map(|account_id| {
                rotated_principal::ActiveModel {
                    schedule_id: Set(schedule_id),
                    account_id: Set(*account_id),
                }
            }))
            .exec(&txn)
            .await
            .map_err(txn_err)?;
        }
        if !rotated_secondary.is_empty() {
            rotated_secondary::Entity::insert_many(rotated_secondary.iter().map(|account_id| {
                rotated_secondary::ActiveModel {
                    schedule_id: Set(schedule_id),
                    account_id: Set(*account_id),
                }
            }))
            .exec(&txn)
            .await
            .map_err(txn_err)?;
        }

        ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::CurrentlyActive, Expr::value(currently_active))
            .col_expr(ScheduleColumn::LastRotatedAt, Expr::value(Utc::now()))
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ScheduleColumn::Id.eq(schedule_id))
            .exec(&txn)
            .await
            .map_err(txn_err)?;

        txn.commit().await.map_err(txn_err)?;
        Ok(())
    }

    // ---- schedule account pools ----

    pub async fn selected_account_ids(&self, schedule_id: i64) -> Result<Vec<i64>> {
        Ok(selected_account::Entity::find()
            .filter(selected_account::Column::ScheduleId.eq(schedule_id))
            .all(&*self.db)
            .await
            .map_err(query_err)?
            .into_iter()
            .map(|r| r.account_id)
            .collect())
    }

    pub async fn principal_account_ids(&self, schedule_id: i64) -> Result<Vec<i64>> {
        Ok(principal_account::Entity::find()
            .filter(principal_account::Column::ScheduleId.eq(schedule_id))
            .all(&*self.db)
            .await
            .map_err(query_err)?
            .into_iter()
            .map(|r| r.account_id)
            .collect())
    }

    pub async fn secondary_account_ids(&self, schedule_id: i64) -> Result<Vec<i64>> {
        Ok(secondary_account::Entity::find()
            .filter(secondary_account::Column::ScheduleId.eq(schedule_id))
            .all(&*self.db)
            .await
            .map_err(query_err)?
            .into_iter()
            .map(|r| r.account_id)
            .collect())
    }

    pub async fn rotated_principal_ids(&self, schedule_id: i64) -> Result<Vec<i64>> {
        Ok(rotated_principal::Entity::find()
            .filter(rotated_principal::Column::ScheduleId.eq(schedule_id))
            .all(&*self.db)
            .await
            .map_err(query_err)?
            .into_iter()
            .map(|r| r.account_id)
            .collect())
    }

    // ---- accounts ----

    pub async fn load_account(&self, id: i64) -> Result<AccountModel> {
        AccountEntity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(query_err)?
            .ok_or_else(|| OrmError::NotFound.into())
    }

    pub async fn load_accounts(&self, ids: &[i64]) -> Result<Vec<AccountModel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        AccountEntity::find()
            .filter(AccountColumn::Id.is_in(ids.iter().copied()))
            .all(&*self.db)
            .await
            .map_err(query_err)
    }

    pub async fn active_accounts_of_user(&self, user_id: i64) -> Result<Vec<AccountModel>> {
        AccountEntity::find()
            .filter(AccountColumn::UserId.eq(user_id))
            .filter(AccountColumn::Status.eq(AccountStatus::Active))
            .all(&*self.db)
            .await
            .map_err(query_err)
    }

    pub async fn set_account_status(
        &self,
        id: i64,
        status: AccountStatus,
        last_message: Option<String>,
    ) -> Result<()> {
        let mut update = AccountEntity::update_many()
            .col_expr(AccountColumn::Status, Expr::value(status))
            .col_expr(AccountColumn::UpdatedAt, Expr::value(Utc::now()));
        if let Some(message) = last_message {
            update = update.col_expr(AccountColumn::LastMessage, Expr::value(message));
        }
        update
            .filter(AccountColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn persist_token(
        &self,
        account_id: i64,
        access_token: &str,
        token_expiry: chrono::DateTime<Utc>,
    ) -> Result<()> {
        AccountEntity::update_many()
            .col_expr(AccountColumn::AccessToken, Expr::value(access_token))
            .col_expr(AccountColumn::TokenExpiry, Expr::value(token_expiry))
            .col_expr(AccountColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(AccountColumn::Id.eq(account_id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn persist_channel(
        &self,
        account_id: i64,
        channel_id: &str,
        channel_title: &str,
    ) -> Result<()> {
        AccountEntity::update_many()
            .col_expr(AccountColumn::ChannelId, Expr::value(channel_id))
            .col_expr(AccountColumn::ChannelTitle, Expr::value(channel_title))
            .filter(AccountColumn::Id.eq(account_id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Post-success bookkeeping: clears the proxy failure streak, restores
    /// `active`, stamps `last_used` and rolls the daily counter forward.
    pub async fn record_account_success(&self, account: &AccountModel, today: NaiveDate) -> Result<()> {
        let rolled_over = account.daily_usage_date != Some(today);
        let comment_count = if rolled_over { 1 } else { account.comment_count + 1 };
        let like_count = if rolled_over { 0 } else { account.like_count };

        AccountEntity::update_many()
            .col_expr(AccountColumn::ProxyErrorCount, Expr::value(0))
            .col_expr(AccountColumn::Status, Expr::value(AccountStatus::Active))
            .col_expr(AccountColumn::LastUsed, Expr::value(Utc::now()))
            .col_expr(AccountColumn::CommentCount, Expr::value(comment_count))
            .col_expr(AccountColumn::LikeCount, Expr::value(like_count))
            .col_expr(AccountColumn::DailyUsageDate, Expr::value(today))
            .col_expr(AccountColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(AccountColumn::Id.eq(account.id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Returns the new streak count after incrementing; flips the account
    /// inactive once the threshold is reached.
    pub async fn record_proxy_error(&self, account: &AccountModel) -> Result<i32> {
        let new_count = account.proxy_error_count + 1;
        let deactivate = new_count >= account.proxy_error_threshold;

        let mut update = AccountEntity::update_many()
            .col_expr(AccountColumn::ProxyErrorCount, Expr::value(new_count))
            .col_expr(AccountColumn::UpdatedAt, Expr::value(Utc::now()));
        if deactivate {
            update = update
                .col_expr(AccountColumn::Status, Expr::value(AccountStatus::Inactive))
                .col_expr(
                    AccountColumn::LastMessage,
                    Expr::value(format!("deactivated after {} proxy errors", new_count)),
                );
        }
        update
            .filter(AccountColumn::Id.eq(account.id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(new_count)
    }

    pub async fn record_duplication(&self, account_id: i64) -> Result<()> {
        AccountEntity::update_many()
            .col_expr(
                AccountColumn::DuplicationCount,
                Expr::col(AccountColumn::DuplicationCount).add(1),
            )
            .filter(AccountColumn::Id.eq(account_id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn assign_proxy(&self, account_id: i64, proxy_id: Option<i64>) -> Result<()> {
        AccountEntity::update_many()
            .col_expr(AccountColumn::ProxyId, Expr::value(proxy_id))
            .filter(AccountColumn::Id.eq(account_id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ---- proxies ----

    pub async fn load_proxy(&self, id: i64) -> Result<Option<ProxyModel>> {
        ProxyEntity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(query_err)
    }

    pub async fn update_proxy_probe(
        &self,
        id: i64,
        status: ProxyStatus,
        speed_ms: Option<i32>,
    ) -> Result<()> {
        ProxyEntity::update_many()
            .col_expr(ProxyColumn::Status, Expr::value(status))
            .col_expr(ProxyColumn::LastChecked, Expr::value(Utc::now()))
            .col_expr(ProxyColumn::ConnectionSpeed, Expr::value(speed_ms))
            .col_expr(ProxyColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ProxyColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Random active proxy of the same user, excluding the one that just
    /// failed. Used by the proxy-error recovery path.
    pub async fn random_active_proxy(
        &self,
        user_id: i64,
        exclude: Option<i64>,
    ) -> Result<Option<ProxyModel>> {
        let mut query = ProxyEntity::find()
            .filter(ProxyColumn::UserId.eq(user_id))
            .filter(ProxyColumn::Status.eq(ProxyStatus::Active));
        if let Some(exclude_id) = exclude {
            query = query.filter(ProxyColumn::Id.ne(exclude_id));
        }
        let proxies = query.all(&*self.db).await.map_err(query_err)?;
        Ok(proxies.choose(&mut rand::thread_rng()).cloned())
    }

    // ---- api profiles ----

    pub async fn load_api_profile(&self, id: i64) -> Result<Option<ApiProfileModel>> {
        ApiProfileEntity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(query_err)
    }

    pub async fn add_profile_quota(&self, id: i64, units: i64) -> Result<()> {
        ApiProfileEntity::update_many()
            .col_expr(
                ApiProfileColumn::UsedQuota,
                Expr::col(ApiProfileColumn::UsedQuota).add(units),
            )
            .col_expr(ApiProfileColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ApiProfileColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn mark_profile_exceeded(&self, id: i64) -> Result<()> {
        ApiProfileEntity::update_many()
            .col_expr(ApiProfileColumn::Status, Expr::value(ApiProfileStatus::Exceeded))
            .col_expr(ApiProfileColumn::ExceededAt, Expr::value(Utc::now()))
            .col_expr(ApiProfileColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ApiProfileColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// At most one profile is active; activation deactivates the rest in
    /// the same transaction.
    pub async fn activate_profile(&self, user_id: i64, profile_id: i64) -> Result<()> {
        let txn = self.db.begin().await.map_err(txn_err)?;

        ApiProfileEntity::update_many()
            .col_expr(ApiProfileColumn::IsActive, Expr::value(false))
            .filter(ApiProfileColumn::UserId.eq(user_id))
            .exec(&txn)
            .await
            .map_err(txn_err)?;
        ApiProfileEntity::update_many()
            .col_expr(ApiProfileColumn::IsActive, Expr::value(true))
            .filter(ApiProfileColumn::Id.eq(profile_id))
            .exec(&txn)
            .await
            .map_err(txn_err)?;

        txn.commit().await.map_err(txn_err)?;
        Ok(())
    }

    // ---- comments ----

    pub async fn load_comment(&self, id: i64) -> Result<CommentModel> {
        CommentEntity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(query_err)?
            .ok_or_else(|| OrmError::NotFound.into())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_comment(
        &self,
        user_id: i64,
        schedule_id: i64,
        account_id: i64,
        video_id: &str,
        parent_id: Option<String>,
        content: &str,
        scheduled_for: chrono::DateTime<Utc>,
        last_previous_account_id: Option<i64>,
    ) -> Result<CommentModel> {
        let now = Utc::now();
        CommentActiveModel {
            user_id: Set(user_id),
            schedule_id: Set(schedule_id),
            account_id: Set(account_id),
            video_id: Set(video_id.to_string()),
            parent_id: Set(parent_id),
            content: Set(content.to_string()),
            status: Set(CommentStatus::Pending),
            scheduled_for: Set(Some(scheduled_for)),
            posted_at: Set(None),
            error_message: Set(None),
            retry_count: Set(0),
            external_id: Set(None),
            last_previous_account_id: Set(last_previous_account_id),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&*self.db)
        .await
        .map_err(query_err)
    }

    /// `posted` requires the upstream id; enforced here so the invariant
    /// holds no matter who calls.
    pub async fn mark_comment_posted(&self, id: i64, external_id: &str) -> Result<()> {
        CommentEntity::update_many()
            .col_expr(CommentColumn::Status, Expr::value(CommentStatus::Posted))
            .col_expr(CommentColumn::ExternalId, Expr::value(external_id))
            .col_expr(CommentColumn::PostedAt, Expr::value(Utc::now()))
            .col_expr(CommentColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(CommentColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    pub async fn mark_comment_failed(&self, id: i64, error_message: &str) -> Result<()> {
        CommentEntity::update_many()
            .col_expr(CommentColumn::Status, Expr::value(CommentStatus::Failed))
            .col_expr(CommentColumn::ErrorMessage, Expr::value(error_message))
            .col_expr(
                CommentColumn::RetryCount,
                Expr::col(CommentColumn::RetryCount).add(1),
            )
            .col_expr(CommentColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(CommentColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Claims a pending comment for posting. Returns `false` when another
    /// delivery of the same job already moved it past `pending`, which is
    /// what makes redelivery harmless.
    pub async fn claim_comment_for_posting(&self, id: i64) -> Result<bool> {
        let result = CommentEntity::update_many()
            .col_expr(CommentColumn::Status, Expr::value(CommentStatus::Scheduled))
            .col_expr(CommentColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(CommentColumn::Id.eq(id))
            .filter(CommentColumn::Status.eq(CommentStatus::Pending))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected == 1)
    }

    /// Returns a transiently failed attempt to the pending state so the
    /// queue retry can claim it again.
    pub async fn revert_comment_to_pending(&self, id: i64) -> Result<()> {
        CommentEntity::update_many()
            .col_expr(CommentColumn::Status, Expr::value(CommentStatus::Pending))
            .col_expr(CommentColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(CommentColumn::Id.eq(id))
            .filter(CommentColumn::Status.eq(CommentStatus::Scheduled))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    /// Per-status counts for one schedule, for the reconciliation loop.
    pub async fn comment_status_counts(&self, schedule_id: i64) -> Result<(i64, i64, i64, i64)> {
        let mut total = 0;
        let mut posted = 0;
        let mut failed = 0;
        let mut pending = 0;

        for status in [
            CommentStatus::Pending,
            CommentStatus::Scheduled,
            CommentStatus::Posted,
            CommentStatus::Failed,
        ] {
            let count = CommentEntity::find()
                .filter(CommentColumn::ScheduleId.eq(schedule_id))
                .filter(CommentColumn::Status.eq(status.clone()))
                .count(&*self.db)
                .await
                .map_err(query_err)? as i64;
            total += count;
            match status {
                CommentStatus::Posted => posted = count,
                CommentStatus::Failed => failed = count,
                CommentStatus::Pending | CommentStatus::Scheduled => pending += count,
            }
        }
        Ok((total, posted, failed, pending))
    }

    // ---- view schedules ----

    pub async fn load_view_schedule(&self, id: i64) -> Result<ViewScheduleModel> {
        ViewScheduleEntity::find_by_id(id)
            .one(&*self.db)
            .await
            .map_err(query_err)?
            .ok_or_else(|| OrmError::NotFound.into())
    }

    pub async fn load_active_view_schedules(&self) -> Result<Vec<ViewScheduleModel>> {
        ViewScheduleEntity::find()
            .filter(ViewScheduleColumn::Status.eq(ScheduleStatus::Active))
            .all(&*self.db)
            .await
            .map_err(query_err)
    }

    pub async fn persist_view_next_run(
        &self,
        id: i64,
        next_run_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        ViewScheduleEntity::update_many()
            .col_expr(ViewScheduleColumn::NextRunAt, Expr::value(next_run_at))
            .col_expr(ViewScheduleColumn::LastProcessedAt, Expr::value(Utc::now()))
            .filter(ViewScheduleColumn::Id.eq(id))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    // ---- daily reset ----

    pub async fn reset_all_profiles(&self) -> Result<u64> {
        let result = ApiProfileEntity::update_many()
            .col_expr(ApiProfileColumn::UsedQuota, Expr::value(0i64))
            .col_expr(
                ApiProfileColumn::Status,
                Expr::value(ApiProfileStatus::NotExceeded),
            )
            .col_expr(
                ApiProfileColumn::ExceededAt,
                Expr::value(Option::<chrono::DateTime<Utc>>::None),
            )
            .col_expr(ApiProfileColumn::UpdatedAt, Expr::value(Utc::now()))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected)
    }

    /// Daily amnesty: inactive and limited accounts come back with a clean
    /// proxy-error slate. `paused`/`completed` schedules are never touched.
    pub async fn reset_sidelined_accounts(&self) -> Result<u64> {
        let result = AccountEntity::update_many()
            .col_expr(AccountColumn::Status, Expr::value(AccountStatus::Active))
            .col_expr(AccountColumn::ProxyErrorCount, Expr::value(0))
            .col_expr(AccountColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(
                AccountColumn::Status
                    .eq(AccountStatus::Inactive)
                    .or(AccountColumn::Status.eq(AccountStatus::Limited)),
            )
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected)
    }

    pub async fn reset_errored_schedules(&self) -> Result<Vec<i64>> {
        let stuck: Vec<i64> = ScheduleEntity::find()
            .select_only()
            .column(ScheduleColumn::Id)
            .filter(
                ScheduleColumn::Status
                    .eq(ScheduleStatus::Error)
                    .or(ScheduleColumn::Status.eq(ScheduleStatus::RequiresReview)),
            )
            .into_tuple()
            .all(&*self.db)
            .await
            .map_err(query_err)?;

        if stuck.is_empty() {
            return Ok(stuck);
        }

        let result = ScheduleEntity::update_many()
            .col_expr(ScheduleColumn::Status, Expr::value(ScheduleStatus::Active))
            .col_expr(ScheduleColumn::ErrorCount, Expr::value(0))
            .col_expr(ScheduleColumn::ErrorMessage, Expr::value(Option::<String>::None))
            .col_expr(ScheduleColumn::UpdatedAt, Expr::value(Utc::now()))
            .filter(ScheduleColumn::Id.is_in(stuck.clone()))
            .exec(&*self.db)
            .await
            .map_err(query_err)?;
        if result.rows_affected != stuck.len() as u64 {
            warn!(
                "Daily reset expected to restore {} schedules, touched {}",
                stuck.len(),
                result.rows_affected
            );
        }
        Ok(stuck)
    }
}
