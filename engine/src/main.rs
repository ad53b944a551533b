use common::State;
use engine::Engine;
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    utils::logger::init("info,sqlx=warn");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    info!("Loading configuration from {}", config_path);

    let state = Arc::new(State::new(&config_path).await);
    let engine = match Engine::new(state).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Engine construction failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = engine.start().await {
        error!("Engine start failed: {}", e);
        std::process::exit(1);
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => error!("Signal handler failed: {}", e),
    }
    engine.shutdown().await;
}
