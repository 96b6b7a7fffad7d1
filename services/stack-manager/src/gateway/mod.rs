//! Cluster gateway interface.
//!
//! The gateway abstracts the cluster runtime the manager needs:
//! - Creating and deleting the workload behind a stack
//! - Querying a workload's live status
//! - Enumerating every workload this manager owns (for the orphan sweep)
//! - Probing aggregate capacity (for admission)
//!
//! [`MockGateway`] keeps everything in memory for development and tests;
//! [`KubernetesGateway`] talks to a real API server. [`TimeoutGateway`]
//! bounds every call of whatever it wraps.

mod kubernetes;
mod mock;
mod timeout;

pub use kubernetes::{KubernetesConfig, KubernetesGateway};
pub use mock::MockGateway;
pub use timeout::TimeoutGateway;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use stackd_id::StackId;
use thiserror::Error;

use crate::stack::ResourceRequests;

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The call did not finish within the configured bound.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The cluster API could not be reached.
    #[error("cluster request failed: {0}")]
    Request(String),

    /// The cluster API answered with an error status.
    #[error("cluster API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The cluster API answered with something we could not read.
    #[error("unexpected cluster response: {0}")]
    Decode(String),

    /// The runtime refused or failed the operation.
    #[error("{0}")]
    Unavailable(String),
}

/// Stable name correlating a live workload with its stack record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkloadHandle(String);

impl WorkloadHandle {
    /// The handle a stack's workload is created under.
    pub fn for_stack(stack_id: StackId) -> Self {
        Self(stack_id.dns_label())
    }

    /// Wrap a name reported by the cluster.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The stack this handle was derived from, if it follows the naming scheme.
    pub fn stack_id(&self) -> Option<StackId> {
        StackId::from_dns_label(&self.0).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live status of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    Ready,
    Pending,
    Dead,
}

/// Everything needed to materialize one stack's workload.
#[derive(Debug, Clone)]
pub struct WorkloadRequest {
    pub stack_id: StackId,
    pub manifest: serde_json::Value,
    pub target_port: u16,
    pub node_port: u16,
    pub requests: ResourceRequests,
}

/// One workload currently present in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveWorkload {
    pub handle: WorkloadHandle,
    pub created_at: Option<DateTime<Utc>>,
}

/// Aggregate cluster capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterCapacity {
    pub allocatable_cpu_milli: i64,
    pub allocatable_memory_bytes: i64,
    pub requested_cpu_milli: i64,
    pub requested_memory_bytes: i64,
}

impl ClusterCapacity {
    /// Describe the first dimension that cannot fit `extra`, if any.
    pub fn shortfall(&self, extra: ResourceRequests) -> Option<String> {
        let cpu = self.requested_cpu_milli.saturating_add(extra.cpu_milli);
        if cpu > self.allocatable_cpu_milli {
            return Some(format!(
                "cpu {cpu}m requested of {}m allocatable",
                self.allocatable_cpu_milli
            ));
        }

        let memory = self.requested_memory_bytes.saturating_add(extra.memory_bytes);
        if memory > self.allocatable_memory_bytes {
            return Some(format!(
                "memory {memory} bytes requested of {} allocatable",
                self.allocatable_memory_bytes
            ));
        }

        None
    }
}

/// Capability interface onto the cluster runtime.
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Materialize a workload tagged with the stack id.
    async fn create_workload(&self, request: WorkloadRequest) -> Result<WorkloadHandle, GatewayError>;

    /// Tear a workload down. Deleting a workload that is already gone succeeds.
    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), GatewayError>;

    /// Query a workload's live status. A missing workload is `Dead`.
    async fn workload_status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus, GatewayError>;

    /// Every workload owned by this manager.
    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, GatewayError>;

    /// Aggregate allocatable vs requested resources.
    async fn capacity(&self) -> Result<ClusterCapacity, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_roundtrip() {
        let id = StackId::new();
        let handle = WorkloadHandle::for_stack(id);
        assert_eq!(handle.stack_id(), Some(id));
        assert_eq!(WorkloadHandle::from_name("kube-dns").stack_id(), None);
    }

    #[test]
    fn test_capacity_shortfall() {
        let capacity = ClusterCapacity {
            allocatable_cpu_milli: 2000,
            allocatable_memory_bytes: 1024,
            requested_cpu_milli: 1500,
            requested_memory_bytes: 512,
        };
        let fits = ResourceRequests {
            cpu_milli: 500,
            memory_bytes: 512,
        };
        assert_eq!(capacity.shortfall(fits), None);

        let too_much_cpu = ResourceRequests {
            cpu_milli: 501,
            memory_bytes: 0,
        };
        assert!(capacity.shortfall(too_much_cpu).unwrap().starts_with("cpu"));

        let too_much_memory = ResourceRequests {
            cpu_milli: 0,
            memory_bytes: 513,
        };
        assert!(capacity.shortfall(too_much_memory).unwrap().starts_with("memory"));

        let huge = ResourceRequests {
            cpu_milli: i64::MAX,
            memory_bytes: 0,
        };
        assert!(capacity.shortfall(huge).unwrap().starts_with("cpu"));
    }
}
