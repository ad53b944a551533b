use chrono::Utc;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// A posting identity. `refresh_token` must be present for any account in
/// `Active` status; the posting worker demotes an account whose refresh
/// fails. Daily counters roll over when `daily_usage_date` is stale.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(schema_name = "base", table_name = "account")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    #[sea_orm(nullable)]
    pub proxy_id: Option<i64>,
    #[sea_orm(nullable)]
    pub api_profile_id: Option<i64>,
    pub name: String,
    #[sea_orm(column_type = "Text", nullable)]
    pub access_token: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub refresh_token: Option<String>,
    #[sea_orm(nullable)]
    pub token_expiry: Option<DateTimeUtc>,
    #[sea_orm(nullable)]
    pub channel_id: Option<String>,
    #[sea_orm(nullable)]
    pub channel_title: Option<String>,
    pub status: AccountStatus,
    #[sea_orm(nullable)]
    pub last_used: Option<DateTimeUtc>,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_message: Option<String>,
    pub proxy_error_count: i32,
    pub duplication_count: i32,
    pub proxy_error_threshold: i32,
    pub comment_count: i32,
    pub like_count: i32,
    #[sea_orm(nullable)]
    pub daily_usage_date: Option<Date>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(10))")]
pub enum AccountStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "inactive")]
    Inactive,
    /// Quota-limited until the next daily reset; excluded from dispatch.
    #[sea_orm(string_value = "limited")]
    Limited,
}

impl Model {
    pub fn token_expired(&self) -> bool {
        match self.token_expiry {
            Some(expiry) => expiry <= Utc::now(),
            None => true,
        }
    }

    /// Today's comment count, treating a stale `daily_usage_date` as zero.
    pub fn comments_today(&self, today: Date) -> i32 {
        if self.daily_usage_date == Some(today) {
            self.comment_count
        } else {
            0
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
    #[sea_orm(
        belongs_to = "super::proxy::Entity",
        from = "Column::ProxyId",
        to = "super::proxy::Column::Id"
    )]
    Proxy,
    #[sea_orm(
        belongs_to = "super::api_profile::Entity",
        from = "Column::ApiProfileId",
        to = "super::api_profile::Column::Id"
    )]
    ApiProfile,
    #[sea_orm(has_many = "super::comment::Entity")]
    Comment,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::proxy::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Proxy.def()
    }
}

impl Related<super::api_profile::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ApiProfile.def()
    }
}

impl Related<super::comment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Comment.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
