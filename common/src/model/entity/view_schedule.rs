use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use super::schedule::{IntervalUnit, ScheduleStatus};

/// Watch-simulation plan; the thin sibling of `schedule`. One tick staggers
/// its target videos across the interval and rolls `probability` per video.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(schema_name = "base", table_name = "view_schedule")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub status: ScheduleStatus,
    /// JSON array of video ids.
    pub target_videos: Json,
    pub interval_value: i32,
    pub interval_unit: IntervalUnit,
    /// Chance each enqueued view actually runs, 0..=100.
    pub probability: i32,
    pub min_watch_time: i32,
    pub max_watch_time: i32,
    pub auto_like: bool,
    #[sea_orm(nullable)]
    pub next_run_at: Option<DateTimeUtc>,
    #[sea_orm(nullable)]
    pub last_processed_at: Option<DateTimeUtc>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

impl Model {
    pub fn videos(&self) -> Vec<String> {
        serde_json::from_value(self.target_videos.clone()).unwrap_or_default()
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_unit.to_millis(self.interval_value.max(1) as i64)
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
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
