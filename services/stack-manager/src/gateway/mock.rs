//! In-memory cluster gateway.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    ClusterCapacity, ClusterGateway, GatewayError, LiveWorkload, WorkloadHandle, WorkloadRequest,
    WorkloadStatus,
};

#[derive(Debug, Clone)]
struct MockWorkload {
    status: WorkloadStatus,
    created_at: DateTime<Utc>,
    node_port: Option<u16>,
}

#[derive(Debug)]
struct MockState {
    workloads: BTreeMap<WorkloadHandle, MockWorkload>,
    fail_creates: bool,
    start_ready: bool,
    failing_deletes: HashSet<WorkloadHandle>,
    fail_list: bool,
    capacity: ClusterCapacity,
    latency: Option<Duration>,
    create_ack_delay: Option<Duration>,
    deletes: u64,
}

/// Gateway that keeps workloads in a map.
///
/// Every knob is settable at runtime so tests can script cluster behavior:
/// failing creates or deletes, workloads vanishing out of band, foreign
/// workloads appearing, saturated capacity, slow calls.
#[derive(Debug)]
pub struct MockGateway {
    state: Mutex<MockState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                workloads: BTreeMap::new(),
                fail_creates: false,
                start_ready: true,
                failing_deletes: HashSet::new(),
                fail_list: false,
                capacity: ClusterCapacity {
                    allocatable_cpu_milli: i64::MAX / 2,
                    allocatable_memory_bytes: i64::MAX / 2,
                    requested_cpu_milli: 0,
                    requested_memory_bytes: 0,
                },
                latency: None,
                create_ack_delay: None,
                deletes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.lock().fail_creates = fail;
    }

    /// Whether new workloads report `Ready` immediately (default) or `Pending`.
    pub fn set_start_ready(&self, ready: bool) {
        self.lock().start_ready = ready;
    }

    pub fn set_fail_deletes(&self, handle: &WorkloadHandle, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_deletes.insert(handle.clone());
        } else {
            state.failing_deletes.remove(handle);
        }
    }

    pub fn set_fail_list(&self, fail: bool) {
        self.lock().fail_list = fail;
    }

    pub fn set_capacity(&self, capacity: ClusterCapacity) {
        self.lock().capacity = capacity;
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Record created workloads first, then answer after `delay`. Models a
    /// cluster that finishes a create the caller has already given up on.
    pub fn set_create_ack_delay(&self, delay: Option<Duration>) {
        self.lock().create_ack_delay = delay;
    }

    pub fn mark_ready(&self, handle: &WorkloadHandle) {
        self.set_status(handle, WorkloadStatus::Ready);
    }

    pub fn mark_dead(&self, handle: &WorkloadHandle) {
        self.set_status(handle, WorkloadStatus::Dead);
    }

    fn set_status(&self, handle: &WorkloadHandle, status: WorkloadStatus) {
        if let Some(workload) = self.lock().workloads.get_mut(handle) {
            workload.status = status;
        }
    }

    /// Drop a workload without going through the manager.
    pub fn remove(&self, handle: &WorkloadHandle) -> bool {
        self.lock().workloads.remove(handle).is_some()
    }

    /// Add a workload the manager never created.
    pub fn insert_foreign(&self, handle: WorkloadHandle, created_at: DateTime<Utc>) {
        self.lock().workloads.insert(
            handle,
            MockWorkload {
                status: WorkloadStatus::Ready,
                created_at,
                node_port: None,
            },
        );
    }

    pub fn contains(&self, handle: &WorkloadHandle) -> bool {
        self.lock().workloads.contains_key(handle)
    }

    pub fn workload_count(&self) -> usize {
        self.lock().workloads.len()
    }

    pub fn node_port_of(&self, handle: &WorkloadHandle) -> Option<u16> {
        self.lock().workloads.get(handle).and_then(|w| w.node_port)
    }

    pub fn delete_calls(&self) -> u64 {
        self.lock().deletes
    }
}

#[async_trait]
impl ClusterGateway for MockGateway {
    async fn create_workload(&self, request: WorkloadRequest) -> Result<WorkloadHandle, GatewayError> {
        self.simulate_latency().await;

        let handle = WorkloadHandle::for_stack(request.stack_id);
        let ack_delay = {
            let mut state = self.lock();
            if state.fail_creates {
                return Err(GatewayError::Unavailable("mock create failure".to_string()));
            }

            let status = if state.start_ready {
                WorkloadStatus::Ready
            } else {
                WorkloadStatus::Pending
            };
            state.workloads.insert(
                handle.clone(),
                MockWorkload {
                    status,
                    created_at: Utc::now(),
                    node_port: Some(request.node_port),
                },
            );
            state.create_ack_delay
        };
        debug!(handle = %handle, node_port = request.node_port, "Mock workload created");

        if let Some(delay) = ack_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(handle)
    }

    async fn delete_workload(&self, handle: &WorkloadHandle) -> Result<(), GatewayError> {
        self.simulate_latency().await;

        let mut state = self.lock();
        state.deletes += 1;
        if state.failing_deletes.contains(handle) {
            return Err(GatewayError::Unavailable(format!(
                "mock delete failure for {handle}"
            )));
        }
        state.workloads.remove(handle);
        Ok(())
    }

    async fn workload_status(&self, handle: &WorkloadHandle) -> Result<WorkloadStatus, GatewayError> {
        self.simulate_latency().await;

        Ok(self
            .lock()
            .workloads
            .get(handle)
            .map(|w| w.status)
            .unwrap_or(WorkloadStatus::Dead))
    }

    async fn list_live_workloads(&self) -> Result<Vec<LiveWorkload>, GatewayError> {
        self.simulate_latency().await;

        let state = self.lock();
        if state.fail_list {
            return Err(GatewayError::Unavailable("mock list failure".to_string()));
        }
        Ok(state
            .workloads
            .iter()
            .map(|(handle, w)| LiveWorkload {
                handle: handle.clone(),
                created_at: Some(w.created_at),
            })
            .collect())
    }

    async fn capacity(&self) -> Result<ClusterCapacity, GatewayError> {
        self.simulate_latency().await;
        Ok(self.lock().capacity)
    }
}
