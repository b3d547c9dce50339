//! Installation of the global tracing subscriber.
//!
//! The library itself only emits `tracing` events; binaries embedding a
//! consumer call [`init`] once at start-up. `RUST_LOG` overrides the
//! configured level.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Error, Result};

fn filter(config: &LoggingConfig) -> Result<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| Error::Config(format!("invalid log level {:?}: {}", config.level, e))),
    }
}

/// Install the subscriber, failing if the level is invalid or a global
/// subscriber is already set.
pub fn try_init(config: &LoggingConfig) -> Result<()> {
    let filter = filter(config)?;
    let installed = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .try_init(),
    };
    installed.map_err(|e| Error::Config(format!("failed to install log subscriber: {}", e)))
}

/// Install the subscriber, keeping any subscriber that is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    match try_init(config) {
        Err(Error::Config(msg)) if msg.starts_with("failed to install") => {
            tracing::debug!(reason = %msg, "log subscriber already installed");
            Ok(())
        }
        other => other,
    }
}
