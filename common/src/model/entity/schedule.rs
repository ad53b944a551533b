use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A user's posting plan. Timing and limit fields are stored flat and
/// normalised into [`ScheduleKind`] / [`LimitComments`] at the boundary, so
/// the engine never re-interprets overlapping optional fields.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "base", table_name = "schedule")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: ScheduleStatus,
    pub schedule_type: ScheduleType,
    #[sea_orm(nullable)]
    pub start_date: Option<DateTimeUtc>,
    #[sea_orm(nullable)]
    pub end_date: Option<DateTimeUtc>,
    #[sea_orm(nullable)]
    pub cron_expression: Option<String>,
    pub interval_value: i32,
    pub interval_unit: IntervalUnit,
    pub interval_is_random: bool,
    pub interval_min: i32,
    pub interval_max: i32,
    /// JSON array of strings.
    pub comment_templates: Json,
    /// JSON array of `{ "video_id": ..., "title": ... }`.
    pub target_videos: Json,
    /// JSON array of channel ids.
    pub target_channels: Json,
    pub account_selection: AccountSelection,
    pub rotation_enabled: bool,
    pub currently_active: ActivePool,
    #[sea_orm(nullable)]
    pub last_rotated_at: Option<DateTimeUtc>,
    pub use_ai: bool,
    pub include_emojis: bool,
    /// Sleep window bounds, minutes.
    pub min_delay: i32,
    pub max_delay: i32,
    /// Stagger between consecutive dispatches inside a batch.
    pub between_accounts_ms: i64,
    pub limit_value: i32,
    pub limit_min: i32,
    pub limit_max: i32,
    pub limit_is_random: bool,
    pub sleep_delay_minutes: i32,
    #[sea_orm(nullable)]
    pub sleep_delay_start_time: Option<DateTimeUtc>,
    pub last_sleep_trigger_count: i64,
    #[sea_orm(nullable)]
    pub last_used_account_id: Option<i64>,
    #[sea_orm(nullable)]
    pub next_run_at: Option<DateTimeUtc>,
    #[sea_orm(nullable)]
    pub last_processed_at: Option<DateTimeUtc>,
    pub total_comments: i64,
    pub posted_comments: i64,
    pub failed_comments: i64,
    pub error_count: i32,
    #[sea_orm(column_type = "Text", nullable)]
    pub error_message: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum ScheduleStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "paused")]
    Paused,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "error")]
    Error,
    #[sea_orm(string_value = "requires_review")]
    RequiresReview,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum ScheduleType {
    #[sea_orm(string_value = "immediate")]
    Immediate,
    #[sea_orm(string_value = "once")]
    Once,
    #[sea_orm(string_value = "recurring")]
    Recurring,
    #[sea_orm(string_value = "interval")]
    Interval,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(10))")]
pub enum IntervalUnit {
    #[sea_orm(string_value = "minutes")]
    Minutes,
    #[sea_orm(string_value = "hours")]
    Hours,
    #[sea_orm(string_value = "days")]
    Days,
}

impl IntervalUnit {
    pub fn to_millis(self, value: i64) -> i64 {
        match self {
            IntervalUnit::Minutes => value * 60_000,
            IntervalUnit::Hours => value * 3_600_000,
            IntervalUnit::Days => value * 86_400_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum AccountSelection {
    #[sea_orm(string_value = "specific")]
    Specific,
    #[sea_orm(string_value = "random")]
    Random,
    #[sea_orm(string_value = "round-robin")]
    RoundRobin,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(10))")]
pub enum ActivePool {
    #[sea_orm(string_value = "principal")]
    Principal,
    #[sea_orm(string_value = "secondary")]
    Secondary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetVideo {
    pub video_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Normalised timing variant.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleKind {
    Immediate,
    Once { at: Option<DateTimeUtc> },
    Cron { expression: String },
    Interval { spec: IntervalSpec },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalSpec {
    pub value: i32,
    pub unit: IntervalUnit,
    /// `Some((min, max))` when the interval is re-drawn each batch.
    pub random: Option<(i32, i32)>,
}

impl IntervalSpec {
    pub fn millis(&self) -> i64 {
        self.unit.to_millis(self.value.max(1) as i64)
    }
}

/// Normalised sleep-trigger threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitComments {
    Disabled,
    Fixed(i32),
    Random { value: i32, min: i32, max: i32 },
}

impl LimitComments {
    pub fn value(&self) -> i32 {
        match self {
            LimitComments::Disabled => 0,
            LimitComments::Fixed(v) => *v,
            LimitComments::Random { value, .. } => *value,
        }
    }
}

impl Model {
    pub fn kind(&self) -> ScheduleKind {
        match self.schedule_type {
            ScheduleType::Immediate => ScheduleKind::Immediate,
            ScheduleType::Once => ScheduleKind::Once {
                at: self.start_date,
            },
            ScheduleType::Recurring => ScheduleKind::Cron {
                expression: self.cron_expression.clone().unwrap_or_default(),
            },
            ScheduleType::Interval => ScheduleKind::Interval {
                spec: self.interval_spec(),
            },
        }
    }

    pub fn interval_spec(&self) -> IntervalSpec {
        let random = if self.interval_is_random
            && self.interval_min > 0
            && self.interval_max >= self.interval_min
        {
            Some((self.interval_min, self.interval_max))
        } else {
            None
        };
        IntervalSpec {
            value: self.interval_value,
            unit: self.interval_unit,
            random,
        }
    }

    pub fn limit(&self) -> LimitComments {
        if self.limit_value <= 0 {
            return LimitComments::Disabled;
        }
        if self.limit_is_random && self.limit_min > 0 && self.limit_max >= self.limit_min {
            LimitComments::Random {
                value: self.limit_value,
                min: self.limit_min,
                max: self.limit_max,
            }
        } else {
            LimitComments::Fixed(self.limit_value)
        }
    }

    pub fn templates(&self) -> Vec<String> {
        serde_json::from_value(self.comment_templates.clone()).unwrap_or_default()
    }

    pub fn videos(&self) -> Vec<TargetVideo> {
        serde_json::from_value(self.target_videos.clone()).unwrap_or_default()
    }

    /// Stagger anchor; the historical default is 1.5 seconds.
    pub fn stagger_ms(&self) -> i64 {
        if self.between_accounts_ms > 0 {
            self.between_accounts_ms
        } else {
            1_500
        }
    }

    pub fn in_sleep_window(&self, now: DateTimeUtc) -> bool {
        if self.sleep_delay_minutes <= 0 {
            return false;
        }
        match self.sleep_delay_start_time {
            Some(start) => {
                start + chrono::Duration::minutes(self.sleep_delay_minutes as i64) > now
            }
            None => false,
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::UserId",
        to = "super::user::Column::Id"
    )]
    User,
    #[sea_orm(has_many = "super::comment::Entity")]
    Comment,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::comment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Comment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn base_schedule() -> Model {
        Model {
            id: 1,
            user_id: 1,
            name: "plan".into(),
            status: ScheduleStatus::Active,
            schedule_type: ScheduleType::Interval,
            start_date: None,
            end_date: None,
            cron_expression: None,
            interval_value: 2,
            interval_unit: IntervalUnit::Minutes,
            interval_is_random: false,
            interval_min: 0,
            interval_max: 0,
            comment_templates: serde_json::json!(["nice!", "great video"]),
            target_videos: serde_json::json!([{ "video_id": "abc123" }]),
            target_channels: serde_json::json!([]),
            account_selection: AccountSelection::Specific,
            rotation_enabled: false,
            currently_active: ActivePool::Principal,
            last_rotated_at: None,
            use_ai: false,
            include_emojis: false,
            min_delay: 3,
            max_delay: 7,
            between_accounts_ms: 1_500,
            limit_value: 0,
            limit_min: 0,
            limit_max: 0,
            limit_is_random: false,
            sleep_delay_minutes: 0,
            sleep_delay_start_time: None,
            last_sleep_trigger_count: 0,
            last_used_account_id: None,
            next_run_at: None,
            last_processed_at: None,
            total_comments: 0,
            posted_comments: 0,
            failed_comments: 0,
            error_count: 0,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn interval_kind_normalises_random_bounds() {
        let mut schedule = base_schedule();
        schedule.interval_is_random = true;
        schedule.interval_min = 5;
        schedule.interval_max = 10;

        match schedule.kind() {
            ScheduleKind::Interval { spec } => {
                assert_eq!(spec.random, Some((5, 10)));
                assert_eq!(spec.millis(), 120_000);
            }
            other => panic!("unexpected kind {other:?}"),
        }

        // Degenerate bounds collapse to a fixed interval.
        schedule.interval_max = 2;
        match schedule.kind() {
            ScheduleKind::Interval { spec } => assert_eq!(spec.random, None),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn limit_normalisation() {
        let mut schedule = base_schedule();
        assert_eq!(schedule.limit(), LimitComments::Disabled);

        schedule.limit_value = 5;
        assert_eq!(schedule.limit(), LimitComments::Fixed(5));

        schedule.limit_is_random = true;
        schedule.limit_min = 3;
        schedule.limit_max = 8;
        assert_eq!(
            schedule.limit(),
            LimitComments::Random {
                value: 5,
                min: 3,
                max: 8
            }
        );
    }

    #[test]
    fn sleep_window_detection() {
        let mut schedule = base_schedule();
        let now = Utc::now();
        assert!(!schedule.in_sleep_window(now));

        schedule.sleep_delay_minutes = 10;
        schedule.sleep_delay_start_time = Some(now - Duration::minutes(5));
        assert!(schedule.in_sleep_window(now));

        schedule.sleep_delay_start_time = Some(now - Duration::minutes(15));
        assert!(!schedule.in_sleep_window(now));
    }

    #[test]
    fn json_columns_deserialise() {
        let schedule = base_schedule();
        assert_eq!(schedule.templates().len(), 2);
        let videos = schedule.videos();
        assert_eq!(videos.len(), 1);
        assert_eq!(videos[0].video_id, "abc123");
        assert!(videos[0].title.is_none());
    }
}
