//! # Game Runtime
//!
//! Entry point for the game backend's real-time layer.
//!
//! Chat membership is served from an in-process [`ChatDirectory`]; chats
//! listed in `GAME_OPEN_CHATS` (comma separated) start open.

use std::sync::Arc;

use anyhow::{Context, Result};
use game_runtime::{ChatDirectory, GameRuntime, RuntimeConfig};
use game_telemetry::{init_telemetry, TelemetryConfig};
use tracing::info;

fn load_directory() -> ChatDirectory {
    let directory = ChatDirectory::new();
    if let Ok(chats) = std::env::var("GAME_OPEN_CHATS") {
        for chat_id in chats.split(',').map(str::trim).filter(|c| !c.is_empty()) {
            directory.open_chat(chat_id);
        }
    }
    directory
}

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env()).context("Failed to initialize logging")?;

    let config = RuntimeConfig::from_env().context("Failed to load configuration")?;
    let runtime = GameRuntime::new(config, Arc::new(load_directory()))
        .context("Failed to start game runtime")?;

    info!("Game runtime is running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    runtime.shutdown();
    Ok(())
}
