//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! The first signal cancels the run: entries already in flight finish, no new
//! ones start, and the fingerprint index is still saved. A second Ctrl+C
//! exits immediately.

use std::io;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit status used when the run is interrupted.
pub const EXIT_INTERRUPTED: i32 = 130;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token cancelled on the first shutdown signal
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request shutdown without a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for shutdown signal (SIGTERM or SIGINT)
    pub async fn wait_for_signal(&self) -> io::Result<()> {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), finishing entries in flight...");
            }
            result = terminate() => {
                result?;
                info!("Received SIGTERM, finishing entries in flight...");
            }
        }
        self.trigger();
        Ok(())
    }

    /// Watch for signals in the background until the returned task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.wait_for_signal().await {
                error!("Failed to install signal handlers: {}", e);
                return;
            }
            if signal::ctrl_c().await.is_ok() {
                warn!("Second interrupt received, exiting without saving the index");
                std::process::exit(EXIT_INTERRUPTED);
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn terminate() -> io::Result<()> {
    signal::unix::signal(signal::unix::SignalKind::terminate())?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> io::Result<()> {
    std::future::pending().await
}
