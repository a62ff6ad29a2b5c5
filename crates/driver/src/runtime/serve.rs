//! Serve — bind the plugin socket and answer the daemon until shutdown.

use std::path::Path;
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info};

use crate::conf::DriverConfig;
use crate::pipeline::PipelineManager;
use crate::plugin;
use crate::runtime::stop::shutdown_signal;

/// Serve the plugin API on the configured unix socket. Pipelines are
/// drained after the listener stops.
pub async fn serve(
    manager: Arc<PipelineManager>,
    config: DriverConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = bind(&config.socket_path).map_err(|e| {
        error!(socket = %config.socket_path, "Failed to bind plugin socket: {}", e);
        e
    })?;

    manager.start_sweep();
    let app = plugin::router(Arc::clone(&manager));

    info!(socket = %config.socket_path, "Logging driver is ready");
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    manager.shutdown().await;
    if let Err(e) = std::fs::remove_file(&config.socket_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            error!(socket = %config.socket_path, "Failed to remove plugin socket: {}", e);
        }
    }

    result?;
    info!("Server shutdown complete");
    Ok(())
}

/// Bind `path`, replacing a socket left behind by an earlier run.
fn bind(path: &str) -> std::io::Result<UnixListener> {
    let path = Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => info!(socket = %path.display(), "Removed stale plugin socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}
