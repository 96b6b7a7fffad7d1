use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use serde::Serialize;
use stackd_reconcile::{diff_views, SweepTally};
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use crate::gateway::{LiveWorkload, WorkloadStatus};
use crate::stack::{Stack, StackError, StackService, StackStatus};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Maximum number of stacks handled at once within a sweep.
    pub concurrency: usize,

    /// Live workloads younger than this are never treated as orphans.
    pub orphan_grace: chrono::Duration,

    /// How long terminal records are kept before being purged.
    pub terminal_retention: chrono::Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            orphan_grace: chrono::Duration::seconds(60),
            terminal_retention: chrono::Duration::days(1),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: SweepTally,
    pub orphans_removed: SweepTally,
    pub vanished_failed: SweepTally,
    pub dead_failed: SweepTally,
    pub promoted: SweepTally,
    /// Live workloads skipped because they are within the orphan grace.
    pub young_skipped: u64,
    pub reconciled: u64,
    pub purged: u64,
    /// Store or gateway reads that failed and cut a sweep short.
    pub read_failures: u64,
    /// Shutdown was observed before every sweep finished.
    pub interrupted: bool,
}

impl SweepReport {
    /// Every per-stack action of the pass folded into one tally.
    pub fn actions(&self) -> SweepTally {
        let mut total = SweepTally::default();
        for tally in [
            self.expired,
            self.orphans_removed,
            self.vanished_failed,
            self.dead_failed,
            self.promoted,
        ] {
            total.merge(tally);
        }
        total
    }

    pub fn failures(&self) -> u64 {
        self.actions().failed + self.read_failures
    }

    /// True if the pass changed nothing and hit no errors.
    pub fn is_idle(&self) -> bool {
        self.actions().succeeded == 0 && self.purged == 0 && self.failures() == 0
    }
}

/// Per-stack outcome: `Ok(true)` applied, `Ok(false)` nothing to do.
type Outcome = Result<bool, StackError>;

/// Converges stack records and live workloads.
pub struct CleanupReconciler {
    service: Arc<StackService>,
    config: ReconcilerConfig,
}

impl CleanupReconciler {
    pub fn new(service: Arc<StackService>, mut config: ReconcilerConfig) -> Self {
        config.concurrency = config.concurrency.max(1);
        Self { service, config }
    }

    pub async fn cleanup_expired_and_orphaned(&self, shutdown: &watch::Receiver<bool>) -> SweepReport {
        self.cleanup_expired_and_orphaned_at(Utc::now(), shutdown)
            .await
    }

    /// Run every sweep as of `now`.
    #[instrument(skip(self, shutdown))]
    pub async fn cleanup_expired_and_orphaned_at(
        &self,
        now: DateTime<Utc>,
        shutdown: &watch::Receiver<bool>,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        // Records are read before the live list so that a stack created in
        // between shows up as a young live workload, never as a vanished record.
        match self.service.store().list_active().await {
            Ok(active) => self.sweep_active(now, active, shutdown, &mut report).await,
            Err(e) => {
                error!(error = %e, "Failed to list active stacks; skipping expiry and orphan sweeps");
                report.read_failures += 1;
            }
        }

        if *shutdown.borrow() {
            report.interrupted = true;
            return report;
        }

        let cutoff = now - self.config.terminal_retention;
        match self.service.store().purge_terminal(cutoff).await {
            Ok(purged) => report.purged = purged,
            Err(e) => {
                warn!(error = %e, "Failed to purge terminal stacks");
                report.read_failures += 1;
            }
        }

        report
    }

    async fn sweep_active(
        &self,
        now: DateTime<Utc>,
        active: Vec<Stack>,
        shutdown: &watch::Receiver<bool>,
        report: &mut SweepReport,
    ) {
        let (expired, current): (Vec<Stack>, Vec<Stack>) =
            active.into_iter().partition(|s| s.is_expired_at(now));

        let service = &self.service;
        let (tally, interrupted) = self
            .bounded(expired, shutdown, |stack| async move {
                retire(service, &stack, StackStatus::Expired).await
            })
            .await;
        report.expired = tally;
        if interrupted {
            report.interrupted = true;
            return;
        }

        let live = match service.gateway().list_live_workloads().await {
            Ok(live) => live,
            Err(e) => {
                error!(error = %e, "Failed to list live workloads; skipping orphan sweep");
                report.read_failures += 1;
                return;
            }
        };

        let diff = diff_views(
            current,
            live,
            |s: &Stack| s.handle(),
            |w: &LiveWorkload| w.handle.clone(),
        );
        if diff.is_converged() {
            debug!(matched = diff.matched.len(), "Records and live workloads agree");
        }

        let grace = self.config.orphan_grace;
        let (young, orphans): (Vec<LiveWorkload>, Vec<LiveWorkload>) = diff
            .observed_only
            .into_iter()
            .partition(|w| w.created_at.is_some_and(|at| now - at < grace));
        report.young_skipped = young.len() as u64;

        let (tally, interrupted) = self
            .bounded(orphans, shutdown, |workload| async move {
                match service.gateway().delete_workload(&workload.handle).await {
                    Ok(()) => {
                        debug!(handle = %workload.handle, "Orphaned workload removed");
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(handle = %workload.handle, error = %e, "Failed to remove orphaned workload");
                        Err(e.into())
                    }
                }
            })
            .await;
        report.orphans_removed = tally;
        if interrupted {
            report.interrupted = true;
            return;
        }

        let (tally, interrupted) = self
            .bounded(diff.intent_only, shutdown, |stack| async move {
                retire(service, &stack, StackStatus::Failed).await
            })
            .await;
        report.vanished_failed = tally;
        if interrupted {
            report.interrupted = true;
            return;
        }

        self.probe_matched(now, diff.matched, shutdown, report).await;
    }

    /// Check matched stacks against their workload's live status.
    async fn probe_matched(
        &self,
        now: DateTime<Utc>,
        matched: Vec<(Stack, LiveWorkload)>,
        shutdown: &watch::Receiver<bool>,
        report: &mut SweepReport,
    ) {
        let service = &self.service;
        let probes = self
            .collect_bounded(matched, shutdown, |(stack, _)| async move {
                let status = service.gateway().workload_status(&stack.handle()).await;
                (stack, status)
            })
            .await;
        if probes.interrupted {
            report.interrupted = true;
        }

        let mut to_promote = Vec::new();
        let mut dead = Vec::new();
        let mut live_ids = Vec::new();
        for (stack, status) in probes.items {
            match status {
                Ok(WorkloadStatus::Dead) => dead.push(stack),
                Ok(WorkloadStatus::Ready) if stack.status == StackStatus::Pending => {
                    live_ids.push(stack.id);
                    to_promote.push(stack);
                }
                Ok(_) => live_ids.push(stack.id),
                Err(e) => {
                    warn!(stack_id = %stack.id, error = %e, "Failed to probe workload status");
                    report.promoted.record(&Err::<(), _>(e));
                }
            }
        }

        let (tally, _) = self
            .bounded(dead, shutdown, |stack| async move {
                retire(service, &stack, StackStatus::Failed).await
            })
            .await;
        report.dead_failed = tally;

        for stack in to_promote {
            let outcome: Outcome = service.promote(&stack).await.map(|p| p.is_some());
            tally_outcome(&mut report.promoted, &outcome);
        }

        match service.store().mark_reconciled(&live_ids, now).await {
            Ok(count) => report.reconciled = count,
            Err(e) => {
                warn!(error = %e, "Failed to stamp reconciled stacks");
                report.read_failures += 1;
            }
        }
    }

    /// Run `action` over `items` with bounded concurrency, tallying outcomes.
    async fn bounded<T, F, Fut>(
        &self,
        items: Vec<T>,
        shutdown: &watch::Receiver<bool>,
        action: F,
    ) -> (SweepTally, bool)
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let collected = self.collect_bounded(items, shutdown, action).await;
        let mut tally = SweepTally::default();
        for outcome in &collected.items {
            tally_outcome(&mut tally, outcome);
        }
        (tally, collected.interrupted)
    }

    /// Stops starting new items once shutdown is signalled; items already
    /// started run to completion.
    async fn collect_bounded<T, R, F, Fut>(
        &self,
        items: Vec<T>,
        shutdown: &watch::Receiver<bool>,
        action: F,
    ) -> Collected<R>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let total = items.len();
        let mut rx = shutdown.clone();
        let stop = async move {
            let closed = rx.wait_for(|stopping| *stopping).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        };

        let items: Vec<R> = stream::iter(items)
            .take_until(stop)
            .map(action)
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        Collected {
            interrupted: items.len() < total,
            items,
        }
    }
}

struct Collected<R> {
    items: Vec<R>,
    interrupted: bool,
}

fn tally_outcome(tally: &mut SweepTally, outcome: &Outcome) {
    match outcome {
        Ok(false) => tally.record_skipped(),
        other => tally.record(other),
    }
}

async fn retire(service: &StackService, stack: &Stack, to: StackStatus) -> Outcome {
    match service.retire(stack.id, to).await {
        Ok(retired) => Ok(retired.is_some()),
        Err(e) => {
            warn!(stack_id = %stack.id, status = %to, error = %e, "Failed to retire stack");
            Err(e)
        }
    }
}
