//! # Game Telemetry
//!
//! Logging setup shared by game backend binaries.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use game_telemetry::{init_telemetry, TelemetryConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_telemetry(&TelemetryConfig::from_env())?;
//!     // Application code; `tracing` macros now reach the subscriber.
//!     Ok(())
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_SERVICE_NAME` | `game-backend` | Service name in logs |
//! | `GAME_LOG_LEVEL` / `RUST_LOG` | `info` | Log filter |
//! | `GAME_JSON_LOGS` | `true` in containers | JSON output |
//! | `GAME_LOG_SOURCE` | `false` | File and line per event |

mod config;
mod logging;

pub use config::TelemetryConfig;
pub use logging::env_filter;

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(String),

    #[error("A global subscriber is already installed: {0}")]
    AlreadyInitialized(String),
}

/// Install structured logging for the process.
///
/// Call once, early in `main`.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    logging::init_logging(config)
}
