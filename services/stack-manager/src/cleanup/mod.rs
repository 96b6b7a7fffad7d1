//! Cleanup of expired and orphaned stacks.
//!
//! Each invocation of the reconciler runs these sweeps:
//! - Expiry: active stacks past `expires_at` are retired as `expired`
//! - Orphans: live workloads with no active record are torn down
//! - Vanished: active records with no live workload are retired as `failed`
//! - Probe: matched pending stacks are promoted when ready; dead ones fail
//! - Purge: terminal records past the retention window are removed
//!
//! A failure on one stack is logged and counted, never propagated.

mod reconciler;

pub use reconciler::{CleanupReconciler, ReconcilerConfig, SweepReport};
