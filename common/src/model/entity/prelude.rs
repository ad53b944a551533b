pub use super::account::{
    ActiveModel as AccountActiveModel, Column as AccountColumn, Entity as AccountEntity,
    Model as AccountModel,
};
pub use super::api_profile::{
    ActiveModel as ApiProfileActiveModel, Column as ApiProfileColumn, Entity as ApiProfileEntity,
    Model as ApiProfileModel,
};
pub use super::comment::{
    ActiveModel as CommentActiveModel, Column as CommentColumn, Entity as CommentEntity,
    Model as CommentModel,
};
pub use super::proxy::{
    ActiveModel as ProxyActiveModel, Column as ProxyColumn, Entity as ProxyEntity,
    Model as ProxyModel,
};
pub use super::schedule::{
    ActiveModel as ScheduleActiveModel, Column as ScheduleColumn, Entity as ScheduleEntity,
    Model as ScheduleModel,
};
pub use super::user::{
    ActiveModel as UserActiveModel, Column as UserColumn, Entity as UserEntity, Model as UserModel,
};
pub use super::view_schedule::{
    ActiveModel as ViewScheduleActiveModel, Column as ViewScheduleColumn,
    Entity as ViewScheduleEntity, Model as ViewScheduleModel,
};

pub use super::account::AccountStatus;
pub use super::api_profile::ApiProfileStatus;
pub use super::comment::CommentStatus;
pub use super::proxy::{ProxyProtocol, ProxyStatus};
pub use super::schedule::{
    AccountSelection, ActivePool, IntervalSpec, IntervalUnit, LimitComments, ScheduleKind,
    ScheduleStatus, ScheduleType, TargetVideo,
};

pub use super::rel::{
    principal_account, rotated_principal, rotated_secondary, secondary_account, selected_account,
};
