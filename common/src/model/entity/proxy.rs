use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
#[sea_orm(schema_name = "base", table_name = "proxy")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub host: String,
    pub port: i32,
    #[sea_orm(nullable)]
    pub username: Option<String>,
    #[sea_orm(nullable)]
    pub password: Option<String>,
    pub protocol: ProxyProtocol,
    pub status: ProxyStatus,
    #[sea_orm(nullable)]
    pub last_checked: Option<DateTimeUtc>,
    /// Last observed probe roundtrip, milliseconds.
    #[sea_orm(nullable)]
    pub connection_speed: Option<i32>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(10))")]
pub enum ProxyProtocol {
    #[sea_orm(string_value = "http")]
    Http,
    #[sea_orm(string_value = "https")]
    Https,
    #[sea_orm(string_value = "socks5")]
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, EnumIter, DeriveActiveEnum, Serialize, Deserialize)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(10))")]
pub enum ProxyStatus {
    #[sea_orm(string_value = "active")]
    Active,
    #[sea_orm(string_value = "inactive")]
    Inactive,
}

impl Display for Model {
    /// Proxy URL in the form reqwest accepts directly.
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => write!(
                f,
                "{}://{}:{}@{}:{}",
                self.protocol.scheme(),
                username,
                password,
                self.host,
                self.port
            ),
            (Some(username), None) => write!(
                f,
                "{}://{}@{}:{}",
                self.protocol.scheme(),
                username,
                self.host,
                self.port
            ),
            _ => write!(f, "{}://{}:{}", self.protocol.scheme(), self.host, self.port),
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
    #[sea_orm(has_many = "super::account::Entity")]
    Account,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn proxy(username: Option<&str>, password: Option<&str>) -> Model {
        Model {
            id: 1,
            user_id: 1,
            host: "10.0.0.9".into(),
            port: 8080,
            username: username.map(String::from),
            password: password.map(String::from),
            protocol: ProxyProtocol::Socks5,
            status: ProxyStatus::Active,
            last_checked: None,
            connection_speed: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn proxy_url_includes_credentials_when_present() {
        assert_eq!(
            proxy(Some("u"), Some("p")).to_string(),
            "socks5://u:p@10.0.0.9:8080"
        );
        assert_eq!(proxy(Some("u"), None).to_string(), "socks5://u@10.0.0.9:8080");
        assert_eq!(proxy(None, None).to_string(), "socks5://10.0.0.9:8080");
    }
}
