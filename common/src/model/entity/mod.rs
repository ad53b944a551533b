pub mod account;
pub mod api_profile;
pub mod comment;
pub mod proxy;
pub mod rel;
pub mod schedule;
pub mod user;
pub mod view_schedule;

pub mod prelude;

pub use prelude::*;
