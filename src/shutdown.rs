//! Cooperative shutdown
//!
//! The first Ctrl-C (or SIGTERM) cancels the run token: the git command in
//! flight finishes and nothing new is started. A second signal exits at once.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawn the signal listener that feeds `token`
pub fn listen_for_shutdown(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        warn!("Interrupt received, finishing the current repository");
        token.cancel();

        if wait_for_shutdown_signal().await.is_ok() {
            warn!("Second interrupt received, exiting immediately");
            std::process::exit(0);
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            debug!("Ctrl+C received");
        }
        _ = terminate.recv() => debug!("SIGTERM received"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    debug!("Ctrl+C received");
    Ok(())
}
