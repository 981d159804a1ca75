//! Coordinated shutdown of the server and background tasks.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<JoinHandle<()>>,
    grace_period: Duration,
}

impl ShutdownManager {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            grace_period,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, handle: JoinHandle<()>) {
        self.task_handles.push(handle);
    }

    /// Block until ctrl+c, then stop everything.
    pub async fn wait_for_shutdown(self) {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("🛑 Shutdown signal received");
        self.shutdown().await;
    }

    /// Cancel the token and wait up to the grace period for tasks to finish.
    /// Returns true if every task finished in time.
    pub async fn shutdown(mut self) -> bool {
        self.cancel_token.cancel();

        let handles: Vec<JoinHandle<()>> = self.task_handles.drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        match tokio::time::timeout(self.grace_period, drain).await {
            Ok(()) => {
                info!("✓ All tasks shut down gracefully");
                true
            }
            Err(_) => {
                warn!("⏱️  Shutdown timeout: some tasks did not complete");
                false
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
