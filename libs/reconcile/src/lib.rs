//! Reconciliation primitives.
//!
//! Reconciliation compares two views of the same resources:
//!
//! - **Intent**: what the store says should exist (non-terminal records).
//! - **Observed**: what the runtime reports is actually running.
//!
//! Each side's leftovers drive a one-way corrective action. Keeping the
//! differencing itself pure makes it deterministic and testable without a
//! store or a cluster.
//!
//! # Invariants
//!
//! - Differencing is order-insensitive: inputs are treated as sets.
//! - Every key lands in exactly one of `intent_only`, `observed_only`, `matched`.
//! - Outputs are sorted by key, so the same inputs always produce the same plan.

use std::collections::BTreeMap;

use serde::Serialize;

/// Result of differencing the intent view against the observed view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDiff<I, O> {
    /// Present in intent, missing from observed (the resource vanished).
    pub intent_only: Vec<I>,

    /// Present in observed, missing from intent (the resource is garbage).
    pub observed_only: Vec<O>,

    /// Present in both.
    pub matched: Vec<(I, O)>,
}

impl<I, O> ViewDiff<I, O> {
    /// Returns true if both views agree on which keys exist.
    pub fn is_converged(&self) -> bool {
        self.intent_only.is_empty() && self.observed_only.is_empty()
    }
}

impl<I, O> Default for ViewDiff<I, O> {
    fn default() -> Self {
        Self {
            intent_only: Vec::new(),
            observed_only: Vec::new(),
            matched: Vec::new(),
        }
    }
}

/// Difference two views keyed by `K`.
///
/// If a view yields the same key twice the later item wins.
pub fn diff_views<K, I, O, FI, FO>(
    intent: impl IntoIterator<Item = I>,
    observed: impl IntoIterator<Item = O>,
    intent_key: FI,
    observed_key: FO,
) -> ViewDiff<I, O>
where
    K: Ord,
    FI: Fn(&I) -> K,
    FO: Fn(&O) -> K,
{
    let mut intent: BTreeMap<K, I> = intent.into_iter().map(|i| (intent_key(&i), i)).collect();

    let mut diff = ViewDiff::default();
    let observed: BTreeMap<K, O> = observed
        .into_iter()
        .map(|o| (observed_key(&o), o))
        .collect();

    for (key, o) in observed {
        match intent.remove(&key) {
            Some(i) => diff.matched.push((i, o)),
            None => diff.observed_only.push(o),
        }
    }
    diff.intent_only = intent.into_values().collect();

    diff
}

/// Counts of what a sweep did.
///
/// Failures are counted, never propagated: one broken resource must not stop
/// the sweep from handling the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepTally {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl SweepTally {
    /// Record one outcome.
    pub fn record<T, E>(&mut self, outcome: &Result<T, E>) {
        self.attempted += 1;
        match outcome {
            Ok(_) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Record an attempt that needed no action (e.g. another actor won a race).
    pub fn record_skipped(&mut self) {
        self.attempted += 1;
    }

    /// Fold another tally into this one.
    pub fn merge(&mut self, other: SweepTally) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Record {
        id: &'static str,
        port: u16,
    }

    #[test]
    fn test_diff_partitions_keys() {
        let intent = vec![
            Record { id: "a", port: 1 },
            Record { id: "b", port: 2 },
            Record { id: "c", port: 3 },
        ];
        let observed = vec!["c", "d", "a"];

        let diff = diff_views(intent, observed, |r| r.id, |o| *o);

        assert_eq!(diff.intent_only, vec![Record { id: "b", port: 2 }]);
        assert_eq!(diff.observed_only, vec!["d"]);
        assert_eq!(
            diff.matched,
            vec![
                (Record { id: "a", port: 1 }, "a"),
                (Record { id: "c", port: 3 }, "c")
            ]
        );
        assert!(!diff.is_converged());
    }

    #[test]
    fn test_diff_is_order_insensitive() {
        let a = diff_views(vec![3, 1, 2], vec![2, 4], |i| *i, |o| *o);
        let b = diff_views(vec![2, 3, 1], vec![4, 2], |i| *i, |o| *o);
        assert_eq!(a, b);
    }

    #[test]
    fn test_diff_empty_views_converged() {
        let diff: ViewDiff<u8, u8> = diff_views(vec![], vec![], |i| *i, |o| *o);
        assert!(diff.is_converged());
        assert!(diff.matched.is_empty());
    }

    #[test]
    fn test_diff_converged() {
        let diff = diff_views(vec![1, 2], vec![2, 1], |i| *i, |o| *o);
        assert!(diff.is_converged());
        assert_eq!(diff.matched.len(), 2);
    }

    #[test]
    fn test_tally() {
        let mut tally = SweepTally::default();

        tally.record::<(), &str>(&Ok(()));
        tally.record::<(), &str>(&Err("boom"));
        tally.record_skipped();

        let mut total = SweepTally::default();
        total.merge(tally);
        total.merge(tally);

        assert_eq!(
            total,
            SweepTally {
                attempted: 6,
                succeeded: 2,
                failed: 2
            }
        );
        assert_eq!(
            serde_json::to_value(tally).unwrap(),
            serde_json::json!({"attempted": 3, "succeeded": 1, "failed": 1})
        );
    }
}
