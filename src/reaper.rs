use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordinator::Coordinator;

/// Background liveness sweep.
///
/// Every `interval` it asks the coordinator to remove workers whose last
/// heartbeat is older than `worker_timeout`, requeue their running jobs and
/// evict history past `history_retention`. While the coordinator is degraded
/// each tick first tries to reconcile it with the store. A failed step is
/// logged and retried on the next tick.
pub struct Reaper {
    coordinator: Arc<Coordinator>,
    interval: Duration,
}

impl Reaper {
    pub fn new(coordinator: Arc<Coordinator>) -> Self {
        let interval = coordinator.config().reaper_interval;
        Self {
            coordinator,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval = ?self.interval, "Reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Reaper stopping");
                    break;
                }
                _ = interval.tick() => self.sweep().await,
            }
        }
    }

    async fn sweep(&self) {
        if self.coordinator.is_degraded() {
            if let Err(e) = self.coordinator.reconcile().await {
                tracing::error!(error = %e, "Reconcile failed, coordinator still degraded");
                return;
            }
            tracing::info!("Coordinator left degraded mode");
        }
        if let Err(e) = self.coordinator.reap_stale_workers().await {
            tracing::error!(error = %e, "Liveness sweep failed");
        }
        if let Err(e) = self.coordinator.evict_expired().await {
            tracing::error!(error = %e, "History eviction failed");
        }
    }
}
