use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::cleanup::{CleanupReconciler, SweepReport};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("cleanup interval must be greater than zero")]
    ZeroInterval,
}

/// Runs the cleanup reconciler on a fixed interval.
pub struct SchedulerWorker {
    reconciler: Arc<CleanupReconciler>,
    interval: Duration,
}

impl SchedulerWorker {
    pub fn new(reconciler: Arc<CleanupReconciler>, interval: Duration) -> Result<Self, SchedulerError> {
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval);
        }
        Ok(Self {
            reconciler,
            interval,
        })
    }

    /// Run until shutdown is signalled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting cleanup scheduler"
        );

        // The first tick completes immediately, so a pass runs at startup.
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass(&shutdown).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Cleanup scheduler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_pass(&self, shutdown: &watch::Receiver<bool>) {
        let reconciler = self.reconciler.clone();
        let rx = shutdown.clone();
        let pass = tokio::spawn(async move { reconciler.cleanup_expired_and_orphaned(&rx).await });

        match pass.await {
            Ok(report) => log_report(&report),
            Err(e) if e.is_panic() => {
                error!(error = %e, "Cleanup pass panicked; retrying next tick");
            }
            Err(e) => {
                warn!(error = %e, "Cleanup pass was cancelled");
            }
        }
    }
}

fn log_report(report: &SweepReport) {
    if report.is_idle() {
        return;
    }

    let failures = report.failures();
    if failures > 0 {
        warn!(
            expired = report.expired.succeeded,
            orphans_removed = report.orphans_removed.succeeded,
            vanished_failed = report.vanished_failed.succeeded,
            dead_failed = report.dead_failed.succeeded,
            promoted = report.promoted.succeeded,
            purged = report.purged,
            failures,
            interrupted = report.interrupted,
            "Cleanup pass completed with failures"
        );
    } else {
        info!(
            expired = report.expired.succeeded,
            orphans_removed = report.orphans_removed.succeeded,
            vanished_failed = report.vanished_failed.succeeded,
            dead_failed = report.dead_failed.succeeded,
            promoted = report.promoted.succeeded,
            purged = report.purged,
            interrupted = report.interrupted,
            "Cleanup pass complete"
        );
    }
}
