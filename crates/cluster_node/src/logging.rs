//! Logging system setup.

use crate::config::LoggingSettings;
use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn setup_logging(config: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
            .map_err(|e| anyhow!("Failed to install subscriber: {}", e))?;
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init()
            .map_err(|e| anyhow!("Failed to install subscriber: {}", e))?;
    }

    info!("🔧 Logging initialized with level: {}", config.level);
    Ok(())
}
