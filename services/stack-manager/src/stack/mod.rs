//! Stack domain: records, lifecycle service, admission and pod spec validation.
//!
//! A stack is one short-lived workload for a `(user_id, problem_id)` pair,
//! exposed on a node port drawn from a bounded range. Its record starts
//! `Pending`, may become `Running`, and ends in exactly one terminal state:
//!
//! ```text
//! Pending -> Running
//! Pending | Running -> Expired | Failed | Deleted
//! ```
//!
//! Terminal states never transition.

mod admission;
mod error;
mod pod_spec;
mod service;

pub use admission::{AdmissionController, AdmissionLimits};
pub use error::{ErrorKind, StackError};
pub use pod_spec::{parse_bytes, parse_cpu_milli, PodSpec, ResourceRequests};
pub use service::{ServiceConfig, StackService};

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stackd_id::StackId;

use crate::gateway::{WorkloadHandle, WorkloadStatus};

/// Lifecycle status of a stack record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    Pending,
    Running,
    Expired,
    Failed,
    Deleted,
}

impl StackStatus {
    /// Statuses that hold a node port and a live workload.
    pub const ACTIVE: [StackStatus; 2] = [StackStatus::Pending, StackStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Expired => "expired",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !Self::ACTIVE.contains(self)
    }
}

impl std::fmt::Display for StackStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "expired" => Ok(Self::Expired),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown stack status '{other}'")),
        }
    }
}

/// The persisted record of one stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub id: StackId,
    pub user_id: i64,
    pub problem_id: i64,
    /// Manifest exactly as submitted.
    pub pod_spec: String,
    pub target_port: u16,
    pub node_port: u16,
    pub status: StackStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl Stack {
    /// Handle of the live workload that backs this stack.
    pub fn handle(&self) -> WorkloadHandle {
        WorkloadHandle::for_stack(self.id)
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Caller-supplied fields for a new stack.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateStackInput {
    pub user_id: i64,
    pub problem_id: i64,
    pub pod_spec: String,
    pub target_port: i64,
}

/// A stored record merged with a live status query.
#[derive(Debug, Clone, Serialize)]
pub struct StatusDetail {
    pub stack: Stack,
    pub workload: WorkloadStatus,
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub expired: i64,
    pub failed: i64,
    pub deleted: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: StackStatus, count: i64) {
        match status {
            StackStatus::Pending => self.pending += count,
            StackStatus::Running => self.running += count,
            StackStatus::Expired => self.expired += count,
            StackStatus::Failed => self.failed += count,
            StackStatus::Deleted => self.deleted += count,
        }
    }

    pub fn active(&self) -> i64 {
        self.pending + self.running
    }

    pub fn total(&self) -> i64 {
        self.pending + self.running + self.expired + self.failed + self.deleted
    }
}

/// Node port occupancy as reported by `/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct NodePortStats {
    pub min: u16,
    pub max: u16,
    pub capacity: usize,
    pub allocated: usize,
    pub available: usize,
    pub utilization: f64,
}

/// Aggregate statistics for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackStats {
    pub total: i64,
    pub active: i64,
    pub by_status: StatusCounts,
    pub node_ports: NodePortStats,
    pub user_stack_limit: u32,
}
