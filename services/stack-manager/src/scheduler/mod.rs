//! Periodic driver for the cleanup reconciler.
//!
//! The worker runs one pass at startup and then one per interval until
//! shutdown is signalled. Each pass runs in its own task so a panic inside
//! it is logged and the loop carries on at the next tick.

mod worker;

pub use worker::{SchedulerError, SchedulerWorker};
