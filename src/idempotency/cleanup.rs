use crate::error::Result;
use crate::idempotency::coordinator::IdempotencyCoordinator;
use std::sync::Arc;
use std::time::Duration;

/// Background cleanup job for expired idempotency records.
pub struct IdempotencyCleanupJob {
    coordinator: Arc<IdempotencyCoordinator>,
    interval: Duration,
}

impl IdempotencyCleanupJob {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    /// Runs the cleanup job once.
    pub async fn run_once(&self) -> Result<u64> {
        self.coordinator.cleanup_expired().await
    }

    /// Starts the cleanup job in a background task.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency records", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to cleanup expired idempotency records: {}", e);
                    }
                }
            }
        })
    }
}
