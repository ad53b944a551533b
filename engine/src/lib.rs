pub mod broker;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod generator;
pub mod llm;
pub mod maintenance;
pub mod post_worker;
pub mod repository;
pub mod sanitize;
pub mod schedule_worker;
pub mod selector;
pub mod sleep;
pub mod upstream;
pub mod views;

pub use engine::Engine;
