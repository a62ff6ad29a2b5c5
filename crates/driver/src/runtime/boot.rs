//! Boot — logging init, config load, pipeline manager creation.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::conf::DriverConfig;
use crate::pipeline::PipelineManager;

/// Plugin-level verbosity, used when `RUST_LOG` is not set.
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";

/// Filter directive for a `LOG_LEVEL` value such as `debug` or `WARN`.
pub fn level_directive(level: &str) -> Result<String, String> {
    let level = level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(format!("driver={}", level)),
        "warning" => Ok("driver=warn".to_string()),
        other => Err(format!("invalid {} {:?}", ENV_LOG_LEVEL, other)),
    }
}

/// Initialise the tracing / logging subsystem.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directive = match std::env::var(ENV_LOG_LEVEL) {
                Ok(level) => level_directive(&level)?,
                Err(_) => "driver=info".to_string(),
            };
            EnvFilter::try_new(directive)?
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(false))
        .init();
    Ok(())
}

/// Load config and build the pipeline manager.
///
/// Returns `(manager, config)` on success.
pub fn boot() -> Result<(Arc<PipelineManager>, DriverConfig), Box<dyn std::error::Error>> {
    info!("Starting Logz.io logging driver v{}", env!("CARGO_PKG_VERSION"));

    let config = DriverConfig::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    info!(
        socket = %config.socket_path,
        log_root = %config.log_root,
        channel_size = config.channel_size,
        disk_threshold = config.disk_threshold,
        drain_timeout = ?config.drain_timeout,
        "Loaded configuration"
    );

    let manager = PipelineManager::with_http_senders(config.clone());
    info!("Initialized pipeline manager");

    Ok((manager, config))
}
