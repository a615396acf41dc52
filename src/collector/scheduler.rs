//! Periodic collection driver.
//!
//! One long-running task: run a round, sleep one interval, repeat. Rounds
//! therefore never overlap, a slow round simply pushes the next one out
//! (the same coalescing a skipping ticker would give), and an interval
//! changed by a reload takes effect on the next cycle.
//!
//! The immediate first round happens inside the startup configuration
//! apply, so the scheduler always waits a full interval before its first
//! own round.

use crate::collector::CollectorService;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info};

/// Drives periodic collection rounds.
pub struct Scheduler {
    service: Arc<CollectorService>,
}

impl Scheduler {
    /// Create a new scheduler over the service.
    pub fn new(service: Arc<CollectorService>) -> Self {
        Self { service }
    }

    /// Run until shutdown. Exits after the in-flight client call returns.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval = %humantime::format_duration(self.service.current_config().schedule.interval),
            "scheduler started"
        );

        loop {
            let interval = self.service.current_config().schedule.interval;

            tokio::select! {
                _ = sleep(interval) => {
                    let stats = self
                        .service
                        .run_scheduled_round(shutdown.resubscribe())
                        .await;
                    debug!(
                        attempted = stats.attempted,
                        succeeded = stats.succeeded,
                        failed = stats.failed,
                        "collection round finished"
                    );
                }

                _ = shutdown.recv() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }
    }
}
