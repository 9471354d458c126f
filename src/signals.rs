use tracing::{error, info};

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Resolve when the process is asked to shut down
///
/// Handles SIGTERM and SIGINT on unix, Ctrl+C elsewhere. If a handler cannot
/// be installed the failure is logged and only the remaining signal is
/// awaited.
#[cfg(unix)]
pub async fn shutdown_signal() {
    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    match (sigterm, sigint) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown"),
                _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown"),
            }
        }
        (Ok(mut only), Err(e)) | (Err(e), Ok(mut only)) => {
            error!("Failed to setup signal handler: {}", e);
            only.recv().await;
            info!("Shutdown signal received");
        }
        (Err(e), Err(_)) => {
            error!("Failed to setup signal handlers: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, initiating shutdown"),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
