//! Bounded gateway calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::{
    ClusterCapacity, ClusterGateway, GatewayError, LiveWorkload, WorkloadHandle, WorkloadRequest,
    WorkloadStatus,
};

/// Wraps a gateway so that no call can block longer than `timeout`.
pub struct TimeoutGateway {
    inner: Arc<dyn ClusterGateway>,
    timeout: Duration,
}

impl TimeoutGateway {
    pub fn new(inner: Arc<dyn ClusterGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, GatewayError>> + Send,
    ) -> Result<T, GatewayError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Gateway call timed out");
                Err(GatewayError::Timeout {
                    operation,
                    timeout: self.timeout,
                })
            }
        }
    }
}

#[async_trait]
impl ClusterGateway for TimeoutGateway {
    async fn create_workload(&self, request: WorkloadRequest) -> Result<WorkloadHandle, GatewayError> {
        self.bounded("create_workload", self.inner.create_workload(request))
            .await
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), GatewayError> {
        self.bounded("delete_workload", self.inner.delete_workload(handle))
            .await
    }

    async fn workload_status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus, GatewayError> {
        self.bounded("workload_status", self.inner.workload_status(handle))
            .await
    }

    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, GatewayError> {
        self.bounded("list_live_workloads", self.inner.list_live_workloads())
            .await
    }

    async fn capacity(&self) -> Result<ClusterCapacity, GatewayError> {
        self.bounded("capacity", self.inner.capacity()).await
    }
}
