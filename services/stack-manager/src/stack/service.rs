//! Stack lifecycle service.
//!
//! Owns the create/get/delete/list flows. Every path that gives up a stack
//! (explicit delete, expiry, vanished or dead workload) goes through
//! [`StackService::retire`], a compare-and-set on the record, so exactly one
//! caller tears the workload down and releases its port.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use stackd_id::StackId;
use stackd_networking::{NetworkError, PortAllocator};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::{
    AdmissionController, AdmissionLimits, CreateStackInput, NodePortStats, PodSpec, Stack,
    StackError, StackStats, StackStatus, StatusDetail,
};
use crate::db::StackStore;
use crate::gateway::{ClusterGateway, WorkloadHandle, WorkloadRequest, WorkloadStatus};

/// Lifecycle tunables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// How long a stack lives before the reconciler expires it.
    pub stack_ttl: chrono::Duration,

    /// How long `create` waits for the workload to become ready.
    /// Zero returns the pending record immediately.
    pub readiness_wait: Duration,

    /// Gap between readiness polls while waiting.
    pub readiness_poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            stack_ttl: chrono::Duration::hours(2),
            readiness_wait: Duration::ZERO,
            readiness_poll_interval: Duration::from_millis(500),
        }
    }
}

pub struct StackService {
    store: Arc<dyn StackStore>,
    gateway: Arc<dyn ClusterGateway>,
    ports: Arc<PortAllocator>,
    admission: AdmissionController,
    config: ServiceConfig,
}

impl StackService {
    pub fn new(
        store: Arc<dyn StackStore>,
        gateway: Arc<dyn ClusterGateway>,
        ports: Arc<PortAllocator>,
        limits: AdmissionLimits,
        config: ServiceConfig,
    ) -> Self {
        let admission = AdmissionController::new(store.clone(), gateway.clone(), limits);
        Self {
            store,
            gateway,
            ports,
            admission,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn StackStore> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<dyn ClusterGateway> {
        &self.gateway
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Validate, admit, allocate a port, materialize the workload and persist
    /// the record.
    ///
    /// Any failure after the port is allocated releases it again, and a
    /// failure after the workload exists tears the workload down.
    #[instrument(skip(self, input), fields(user_id = input.user_id, problem_id = input.problem_id))]
    pub async fn create(&self, input: CreateStackInput) -> Result<Stack, StackError> {
        let target_port = validate_create(&input)?;
        let spec = PodSpec::parse(&input.pod_spec, target_port)?;

        self.admission
            .admit(input.user_id, input.problem_id, spec.requests())
            .await?;

        let node_port = self.ports.allocate().map_err(|e| match e {
            NetworkError::NoAvailableNodePort { .. } => StackError::NoAvailableNodePort,
            other => StackError::InvalidInput(other.to_string()),
        })?;

        let id = StackId::new();
        let request = WorkloadRequest {
            stack_id: id,
            manifest: spec.manifest().clone(),
            target_port,
            node_port,
            requests: spec.requests(),
        };

        let handle = match self.gateway.create_workload(request).await {
            Ok(handle) => handle,
            Err(e) => {
                // A timed-out create may still land in the cluster, holding
                // the node port the allocator is about to hand out again.
                let handle = WorkloadHandle::for_stack(id);
                if let Err(teardown) = self.gateway.delete_workload(&handle).await {
                    warn!(stack_id = %id, error = %teardown, "Failed to tear down workload after create failure; orphan sweep will retry");
                }
                self.ports.release(node_port);
                warn!(stack_id = %id, node_port, error = %e, "Workload creation failed; port released");
                return Err(e.into());
            }
        };

        let now = Utc::now();
        let stack = Stack {
            id,
            user_id: input.user_id,
            problem_id: input.problem_id,
            pod_spec: spec.raw().to_string(),
            target_port,
            node_port,
            status: StackStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.stack_ttl,
            last_reconciled_at: None,
        };

        if let Err(e) = self.store.insert(&stack).await {
            if let Err(teardown) = self.gateway.delete_workload(&handle).await {
                warn!(stack_id = %id, error = %teardown, "Failed to tear down workload after insert failure");
            }
            self.ports.release(node_port);
            warn!(stack_id = %id, node_port, error = %e, "Stack insert failed; rolled back");
            return Err(e.into());
        }

        info!(stack_id = %id, node_port, "Stack created");

        if self.config.readiness_wait.is_zero() {
            return Ok(stack);
        }
        self.await_readiness(stack).await
    }

    /// Poll the workload until it is ready, dead, or the wait runs out.
    async fn await_readiness(&self, stack: Stack) -> Result<Stack, StackError> {
        let deadline = Instant::now() + self.config.readiness_wait;
        let handle = stack.handle();

        loop {
            match self.gateway.workload_status(&handle).await {
                Ok(WorkloadStatus::Ready) => {
                    return Ok(self.promote(&stack).await?.unwrap_or(stack));
                }
                Ok(WorkloadStatus::Dead) => {
                    self.retire(stack.id, StackStatus::Failed).await?;
                    return Err(StackError::WorkloadFailed(format!(
                        "workload {handle} died before becoming ready"
                    )));
                }
                Ok(WorkloadStatus::Pending) => {}
                Err(e) => {
                    debug!(stack_id = %stack.id, error = %e, "Readiness poll failed");
                }
            }

            if Instant::now() + self.config.readiness_poll_interval > deadline {
                debug!(stack_id = %stack.id, "Readiness wait elapsed; stack stays pending");
                return Ok(stack);
            }
            tokio::time::sleep(self.config.readiness_poll_interval).await;
        }
    }

    /// Move a pending record to running. `None` if it was no longer pending.
    pub async fn promote(&self, stack: &Stack) -> Result<Option<Stack>, StackError> {
        let promoted = self
            .store
            .transition(
                stack.id,
                &[StackStatus::Pending],
                StackStatus::Running,
                Utc::now(),
            )
            .await?;
        if promoted.is_some() {
            info!(stack_id = %stack.id, "Stack running");
        }
        Ok(promoted)
    }

    /// Take an active stack out of service.
    ///
    /// Moves the record from pending/running to `to`. Only the caller that
    /// wins the transition tears down the workload and releases the port;
    /// every other caller gets `None`. Teardown failures are logged and left
    /// for the orphan sweep.
    pub async fn retire(&self, id: StackId, to: StackStatus) -> Result<Option<Stack>, StackError> {
        let Some(stack) = self
            .store
            .transition(id, &StackStatus::ACTIVE, to, Utc::now())
            .await?
        else {
            return Ok(None);
        };

        let handle = stack.handle();
        if let Err(e) = self.gateway.delete_workload(&handle).await {
            warn!(stack_id = %id, handle = %handle, error = %e, "Workload teardown failed; orphan sweep will retry");
        }
        self.ports.release(stack.node_port);

        info!(stack_id = %id, status = %to, node_port = stack.node_port, "Stack retired");
        Ok(Some(stack))
    }

    /// Fetch a visible record. Deleted records are treated as absent.
    pub async fn get(&self, id: StackId) -> Result<Stack, StackError> {
        match self.store.get(id).await? {
            Some(stack) if stack.status != StackStatus::Deleted => Ok(stack),
            _ => Err(StackError::NotFound),
        }
    }

    /// The record merged with a live status query.
    pub async fn get_status_detail(&self, id: StackId) -> Result<StatusDetail, StackError> {
        let stack = self.get(id).await?;
        if !stack.is_active() {
            return Ok(StatusDetail {
                stack,
                workload: WorkloadStatus::Dead,
            });
        }

        let workload = self.gateway.workload_status(&stack.handle()).await?;
        let stack = if workload == WorkloadStatus::Ready && stack.status == StackStatus::Pending {
            match self.promote(&stack).await? {
                Some(promoted) => promoted,
                None => self.get(id).await?,
            }
        } else {
            stack
        };

        Ok(StatusDetail { stack, workload })
    }

    /// Delete an active stack. Terminal or missing stacks are `NotFound`.
    pub async fn delete(&self, id: StackId) -> Result<Stack, StackError> {
        self.retire(id, StackStatus::Deleted)
            .await?
            .ok_or(StackError::NotFound)
    }

    pub async fn list_all(&self) -> Result<Vec<Stack>, StackError> {
        Ok(self.store.list_all().await?)
    }

    pub async fn list_by_user(&self, user_id: i64) -> Result<Vec<Stack>, StackError> {
        if user_id <= 0 {
            return Err(StackError::InvalidInput(
                "user_id must be a positive integer".to_string(),
            ));
        }
        Ok(self.store.list_by_user(user_id).await?)
    }

    pub async fn stats(&self) -> Result<StackStats, StackError> {
        let by_status = self.store.count_by_status().await?;
        let usage = self.ports.usage();

        Ok(StackStats {
            total: by_status.total(),
            active: by_status.active(),
            by_status,
            node_ports: NodePortStats {
                min: usage.min,
                max: usage.max,
                capacity: usage.capacity,
                allocated: usage.allocated,
                available: usage.available(),
                utilization: usage.utilization(),
            },
            user_stack_limit: self.admission.limits().user_stack_limit,
        })
    }

    /// Re-seed the allocator from persisted active stacks.
    ///
    /// Returns the number of ports reserved. Ports outside the configured
    /// range, or already held, are logged and skipped.
    pub async fn recover_ports(&self) -> Result<usize, StackError> {
        let active = self.store.list_active().await?;
        let mut reserved = 0;

        for stack in &active {
            match self.ports.reserve(stack.node_port) {
                Ok(()) => reserved += 1,
                Err(e) => {
                    warn!(stack_id = %stack.id, node_port = stack.node_port, error = %e, "Skipping node port during recovery");
                }
            }
        }

        info!(active = active.len(), reserved, "Node port allocator recovered");
        Ok(reserved)
    }

    pub async fn health_check(&self) -> Result<(), StackError> {
        Ok(self.store.health_check().await?)
    }
}

fn validate_create(input: &CreateStackInput) -> Result<u16, StackError> {
    if input.user_id <= 0 {
        return Err(StackError::InvalidInput(
            "user_id must be a positive integer".to_string(),
        ));
    }
    if input.problem_id <= 0 {
        return Err(StackError::InvalidInput(
            "problem_id must be a positive integer".to_string(),
        ));
    }
    if input.pod_spec.trim().is_empty() {
        return Err(StackError::InvalidInput("pod_spec is required".to_string()));
    }

    u16::try_from(input.target_port)
        .ok()
        .filter(|port| *port > 0)
        .ok_or_else(|| {
            StackError::InvalidInput("target_port must be between 1 and 65535".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStackStore;
    use crate::gateway::{GatewayError, MockGateway, TimeoutGateway};
    use crate::stack::ErrorKind;
    use rstest::rstest;
    use stackd_networking::NodePortRange;

    const POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: web
spec:
  containers:
    - name: web
      image: nginx:1.27
      ports:
        - containerPort: 80
"#;

    struct Harness {
        service: StackService,
        store: Arc<MemoryStackStore>,
        gateway: Arc<MockGateway>,
        ports: Arc<PortAllocator>,
    }

    fn harness(min: u16, max: u16, config: ServiceConfig) -> Harness {
        let store = Arc::new(MemoryStackStore::new());
        let gateway = Arc::new(MockGateway::new());
        let ports = Arc::new(PortAllocator::new(NodePortRange::new(min, max).unwrap()));
        let service = StackService::new(
            store.clone(),
            gateway.clone(),
            ports.clone(),
            AdmissionLimits::default(),
            config,
        );
        Harness {
            service,
            store,
            gateway,
            ports,
        }
    }

    fn input(user_id: i64, problem_id: i64) -> CreateStackInput {
        CreateStackInput {
            user_id,
            problem_id,
            pod_spec: POD.to_string(),
            target_port: 80,
        }
    }

    #[rstest]
    #[case(0, 1, 80, POD)]
    #[case(1, -4, 80, POD)]
    #[case(1, 1, 0, POD)]
    #[case(1, 1, 70000, POD)]
    #[case(1, 1, 80, "   ")]
    #[tokio::test]
    async fn test_create_rejects_invalid_input(
        #[case] user_id: i64,
        #[case] problem_id: i64,
        #[case] target_port: i64,
        #[case] pod_spec: &str,
    ) {
        let h = harness(31001, 31010, ServiceConfig::default());
        let err = h
            .service
            .create(CreateStackInput {
                user_id,
                problem_id,
                pod_spec: pod_spec.to_string(),
                target_port,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::InvalidInput(_)), "got {err:?}");
        assert_eq!(h.ports.usage().allocated, 0);
    }

    #[tokio::test]
    async fn test_create_returns_pending_record() {
        let h = harness(31001, 31010, ServiceConfig::default());
        let stack = h.service.create(input(1, 1)).await.unwrap();

        assert_eq!(stack.status, StackStatus::Pending);
        assert_eq!(stack.node_port, 31001);
        assert_eq!(stack.pod_spec, POD);
        assert!(h.gateway.contains(&stack.handle()));
        assert_eq!(h.store.get(stack.id).await.unwrap(), Some(stack));
    }

    #[tokio::test]
    async fn test_gateway_failure_releases_port() {
        let h = harness(31001, 31010, ServiceConfig::default());
        h.gateway.set_fail_creates(true);

        let err = h.service.create(input(1, 1)).await.unwrap_err();
        assert!(matches!(err, StackError::Gateway(_)));
        assert_eq!(h.ports.usage().allocated, 0);
        assert!(h.store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_insert_failure_rolls_back_workload_and_port() {
        let h = harness(31001, 31010, ServiceConfig::default());
        // A record the allocator does not know about holds 31001, so the
        // insert trips the node port uniqueness rule.
        let existing = h.service.create(input(9, 9)).await.unwrap();
        h.ports.release(existing.node_port);

        let err = h.service.create(input(1, 1)).await.unwrap_err();
        assert!(matches!(err, StackError::Store(_)));
        assert_eq!(h.gateway.workload_count(), 1);
        assert!(!h.ports.is_allocated(31001));
    }

    #[tokio::test]
    async fn test_delete_twice_is_not_found() {
        let h = harness(31001, 31010, ServiceConfig::default());
        let stack = h.service.create(input(1, 1)).await.unwrap();

        let deleted = h.service.delete(stack.id).await.unwrap();
        assert_eq!(deleted.status, StackStatus::Deleted);
        assert!(!h.ports.is_allocated(stack.node_port));
        assert!(!h.gateway.contains(&stack.handle()));

        assert!(matches!(h.service.delete(stack.id).await, Err(StackError::NotFound)));
        assert!(matches!(h.service.get(stack.id).await, Err(StackError::NotFound)));
    }

    #[tokio::test]
    async fn test_status_detail_promotes_ready_workload() {
        let h = harness(31001, 31010, ServiceConfig::default());
        h.gateway.set_start_ready(false);
        let stack = h.service.create(input(1, 1)).await.unwrap();

        let detail = h.service.get_status_detail(stack.id).await.unwrap();
        assert_eq!(detail.workload, WorkloadStatus::Pending);
        assert_eq!(detail.stack.status, StackStatus::Pending);

        h.gateway.mark_ready(&stack.handle());
        let detail = h.service.get_status_detail(stack.id).await.unwrap();
        assert_eq!(detail.workload, WorkloadStatus::Ready);
        assert_eq!(detail.stack.status, StackStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_wait_promotes_to_running() {
        let config = ServiceConfig {
            readiness_wait: Duration::from_secs(5),
            ..ServiceConfig::default()
        };
        let h = harness(31001, 31010, config);

        let stack = h.service.create(input(1, 1)).await.unwrap();
        assert_eq!(stack.status, StackStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_wait_elapses_pending() {
        let config = ServiceConfig {
            readiness_wait: Duration::from_secs(2),
            ..ServiceConfig::default()
        };
        let h = harness(31001, 31010, config);
        h.gateway.set_start_ready(false);

        let stack = h.service.create(input(1, 1)).await.unwrap();
        assert_eq!(stack.status, StackStatus::Pending);
        assert!(h.ports.is_allocated(stack.node_port));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workload_dead_during_readiness_wait_fails_stack() {
        let config = ServiceConfig {
            readiness_wait: Duration::from_secs(5),
            ..ServiceConfig::default()
        };
        let h = harness(31001, 31010, config);
        h.gateway.set_start_ready(false);

        let (result, ()) = tokio::join!(h.service.create(input(1, 1)), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            for workload in h.gateway.list_live_workloads().await.unwrap() {
                h.gateway.mark_dead(&workload.handle);
            }
        });

        let err = result.unwrap_err();
        assert!(matches!(err, StackError::WorkloadFailed(_)), "got {err:?}");
        assert_eq!(err.kind(), ErrorKind::Internal);

        let stacks = h.store.list_all().await.unwrap();
        assert_eq!(stacks.len(), 1);
        assert_eq!(stacks[0].status, StackStatus::Failed);
        assert!(!h.ports.is_allocated(stacks[0].node_port));
        assert_eq!(h.gateway.workload_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_create_tears_down_late_workload() {
        let mock = Arc::new(MockGateway::new());
        mock.set_create_ack_delay(Some(Duration::from_secs(30)));
        let ports = Arc::new(PortAllocator::new(NodePortRange::new(31001, 31010).unwrap()));
        let store = Arc::new(MemoryStackStore::new());
        let service = StackService::new(
            store.clone(),
            Arc::new(TimeoutGateway::new(mock.clone(), Duration::from_secs(1))),
            ports.clone(),
            AdmissionLimits::default(),
            ServiceConfig::default(),
        );

        let err = service.create(input(1, 1)).await.unwrap_err();
        assert!(
            matches!(err, StackError::Gateway(GatewayError::Timeout { .. })),
            "got {err:?}"
        );
        assert_eq!(mock.workload_count(), 0);
        assert_eq!(ports.usage().allocated, 0);
        assert!(store.list_all().await.unwrap().is_empty());

        // The released port is reusable without tripping over the old Service.
        mock.set_create_ack_delay(None);
        let stack = service.create(input(1, 1)).await.unwrap();
        assert_eq!(stack.node_port, 31001);
        assert_eq!(mock.node_port_of(&stack.handle()), Some(31001));
    }

    #[tokio::test]
    async fn test_overflowing_requests_are_rejected() {
        let h = harness(31001, 31010, ServiceConfig::default());
        let pod_spec = "spec:\n  containers:\n    - name: a\n      image: b\n      resources: {requests: {cpu: 9223372036854775807m}}\n    - name: c\n      image: d\n      resources: {requests: {cpu: 9223372036854775807m}}\n";

        let err = h
            .service
            .create(CreateStackInput {
                user_id: 1,
                problem_id: 1,
                pod_spec: pod_spec.to_string(),
                target_port: 80,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::PodSpecInvalid(_)), "got {err:?}");
        assert_eq!(h.ports.usage().allocated, 0);
        assert_eq!(h.gateway.workload_count(), 0);
    }

    #[tokio::test]
    async fn test_recover_ports_reserves_active_stacks() {
        let h = harness(31001, 31010, ServiceConfig::default());
        let kept = h.service.create(input(1, 1)).await.unwrap();
        let gone = h.service.create(input(1, 2)).await.unwrap();
        h.service.delete(gone.id).await.unwrap();

        // Fresh allocator, as after a restart.
        let ports = Arc::new(PortAllocator::new(NodePortRange::new(31001, 31010).unwrap()));
        let restarted = StackService::new(
            h.store.clone(),
            h.gateway.clone(),
            ports.clone(),
            AdmissionLimits::default(),
            ServiceConfig::default(),
        );

        assert_eq!(restarted.recover_ports().await.unwrap(), 1);
        assert!(ports.is_allocated(kept.node_port));
        assert_eq!(ports.allocate().unwrap(), 31002);
    }

    #[tokio::test]
    async fn test_stats() {
        let h = harness(31001, 31004, ServiceConfig::default());
        let first = h.service.create(input(1, 1)).await.unwrap();
        h.service.create(input(2, 1)).await.unwrap();
        h.service.delete(first.id).await.unwrap();

        let stats = h.service.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.by_status.deleted, 1);
        assert_eq!(stats.node_ports.capacity, 4);
        assert_eq!(stats.node_ports.allocated, 1);
        assert_eq!(stats.node_ports.available, 3);
        assert_eq!(stats.user_stack_limit, 3);
    }
}
