//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! On shutdown the host stops scheduling, cancels running backups and gives
//! them a bounded time to finish writing their logs.

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Shutdown coordinator
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for SIGINT or SIGTERM (or an explicit [`trigger`](Self::trigger)).
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {
                return;
            }
        }

        self.token.cancel();
    }

    /// Waits until `running` reports zero or `grace` elapses. Returns whether
    /// everything finished in time.
    pub async fn drain<F>(&self, grace: Duration, running: F) -> bool
    where
        F: Fn() -> usize,
    {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = running();
            if remaining == 0 {
                info!("Graceful shutdown complete");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Shutdown grace period expired with backups still running");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
