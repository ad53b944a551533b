//! Schedule <-> Account link tables. One table per role so membership swaps
//! during rotation are plain row deletes/inserts inside a transaction.

macro_rules! schedule_account_link {
    ($module:ident, $table:literal) => {
        pub mod $module {
            use sea_orm::entity::prelude::*;
            use serde::{Deserialize, Serialize};

            #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Eq, Serialize, Deserialize)]
            #[sea_orm(schema_name = "base", table_name = $table)]
            pub struct Model {
                #[sea_orm(primary_key, auto_increment = false)]
                pub schedule_id: i64,
                #[sea_orm(primary_key, auto_increment = false)]
                pub account_id: i64,
            }

            #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
            pub enum Relation {
                #[sea_orm(
                    belongs_to = "crate::model::entity::schedule::Entity",
                    from = "Column::ScheduleId",
                    to = "crate::model::entity::schedule::Column::Id"
                )]
                Schedule,
                #[sea_orm(
                    belongs_to = "crate::model::entity::account::Entity",
                    from = "Column::AccountId",
                    to = "crate::model::entity::account::Column::Id"
                )]
                Account,
            }

            impl Related<crate::model::entity::schedule::Entity> for Entity {
                fn to() -> RelationDef {
                    Relation::Schedule.def()
                }
            }

            impl Related<crate::model::entity::account::Entity> for Entity {
                fn to() -> RelationDef {
                    Relation::Account.def()
                }
            }

            impl ActiveModelBehavior for ActiveModel {}
        }
    };
}

schedule_account_link!(selected_account, "rel_schedule_selected_account");
schedule_account_link!(principal_account, "rel_schedule_principal_account");
schedule_account_link!(secondary_account, "rel_schedule_secondary_account");
schedule_account_link!(rotated_principal, "rel_schedule_rotated_principal");
schedule_account_link!(rotated_secondary, "rel_schedule_rotated_secondary");
