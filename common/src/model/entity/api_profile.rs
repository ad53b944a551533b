use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Upstream credential set. At most one profile is active at a time;
/// activation is an atomic swap done in the repository.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(schema_name = "base", table_name = "api_profile")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    #[sea_orm(nullable)]
    pub api_key: Option<String>,
    pub used_quota: i64,
    pub limit_quota: i64,
    pub status: ApiProfileStatus,
    #[sea_orm(nullable)]
    pub exceeded_at: Option<DateTimeUtc>,
    pub is_active: bool,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
pub enum ApiProfileStatus {
    #[sea_orm(string_value = "not_exceeded")]
    NotExceeded,
    #[sea_orm(string_value = "exceeded")]
    Exceeded,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::account::Entity")]
    Account,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
