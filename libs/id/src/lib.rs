//! # stackd-id
//!
//! Typed identifiers for stackd resources.
//!
//! Every identifier is `{prefix}_{ulid}`, e.g. `stk_01HV4Z2WQXKJNM8GPQY6VBKC3D`.
//! The prefix keeps a stack id from being mistaken for a request id, and the
//! ULID keeps ids roughly creation-ordered.
//!
//! Cluster object names have to be lowercase DNS labels, so every id can also
//! render itself as one (`stk-01hv4z2wqxkjnm8gpqy6vbkc3d`) and be recovered
//! from that form.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
