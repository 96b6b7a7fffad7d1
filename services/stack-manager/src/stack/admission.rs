//! Admission checks for new stacks.
//!
//! The checks are advisory reads. Exclusivity is enforced later by the
//! store's unique index and the allocator's atomic allocate.

use std::sync::Arc;

use tracing::debug;

use super::{ResourceRequests, StackError};
use crate::db::StackStore;
use crate::gateway::ClusterGateway;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    /// Maximum number of active stacks per user.
    pub user_stack_limit: u32,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            user_stack_limit: 3,
        }
    }
}

pub struct AdmissionController {
    store: Arc<dyn StackStore>,
    gateway: Arc<dyn ClusterGateway>,
    limits: AdmissionLimits,
}

impl AdmissionController {
    pub fn new(
        store: Arc<dyn StackStore>,
        gateway: Arc<dyn ClusterGateway>,
        limits: AdmissionLimits,
    ) -> Self {
        Self {
            store,
            gateway,
            limits,
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Checks, in order: duplicate (user, problem), per-user ceiling, cluster headroom.
    pub async fn admit(
        &self,
        user_id: i64,
        problem_id: i64,
        requests: ResourceRequests,
    ) -> Result<(), StackError> {
        if self.store.find_active(user_id, problem_id).await?.is_some() {
            return Err(StackError::UserProblemExists);
        }

        let active = self.store.count_active_for_user(user_id).await?;
        if active >= self.limits.user_stack_limit {
            return Err(StackError::UserStackLimitReached {
                limit: self.limits.user_stack_limit,
            });
        }

        let capacity = self.gateway.capacity().await?;
        if let Some(shortfall) = capacity.shortfall(requests) {
            return Err(StackError::ClusterSaturated(shortfall));
        }

        debug!(user_id, problem_id, active, "Stack admitted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStackStore;
    use crate::gateway::{ClusterCapacity, MockGateway};
    use crate::stack::{Stack, StackStatus};
    use chrono::Utc;
    use stackd_id::StackId;

    fn active_stack(user_id: i64, problem_id: i64, node_port: u16) -> Stack {
        let now = Utc::now();
        Stack {
            id: StackId::new(),
            user_id,
            problem_id,
            pod_spec: String::new(),
            target_port: 80,
            node_port,
            status: StackStatus::Running,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::hours(1),
            last_reconciled_at: None,
        }
    }

    fn controller(limit: u32) -> (AdmissionController, Arc<MemoryStackStore>, Arc<MockGateway>) {
        let store = Arc::new(MemoryStackStore::new());
        let gateway = Arc::new(MockGateway::new());
        let controller = AdmissionController::new(
            store.clone(),
            gateway.clone(),
            AdmissionLimits {
                user_stack_limit: limit,
            },
        );
        (controller, store, gateway)
    }

    #[tokio::test]
    async fn test_duplicate_checked_before_limit() {
        let (controller, store, _) = controller(1);
        store.insert(&active_stack(7, 1, 31001)).await.unwrap();

        let err = controller
            .admit(7, 1, ResourceRequests::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::UserProblemExists));

        let err = controller
            .admit(7, 2, ResourceRequests::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StackError::UserStackLimitReached { limit: 1 }));

        // Other users are unaffected.
        controller
            .admit(8, 1, ResourceRequests::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_saturated_cluster_rejects() {
        let (controller, _, gateway) = controller(3);
        gateway.set_capacity(ClusterCapacity {
            allocatable_cpu_milli: 1000,
            allocatable_memory_bytes: 1 << 30,
            requested_cpu_milli: 900,
            requested_memory_bytes: 0,
        });

        let small = ResourceRequests {
            cpu_milli: 100,
            memory_bytes: 0,
        };
        controller.admit(1, 1, small).await.unwrap();

        let large = ResourceRequests {
            cpu_milli: 200,
            memory_bytes: 0,
        };
        let err = controller.admit(1, 1, large).await.unwrap_err();
        assert!(matches!(err, StackError::ClusterSaturated(_)));
    }
}
