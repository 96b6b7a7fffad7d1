use std::sync::Arc;

use chrono::Utc;
use stackd_manager::{
    cleanup::{CleanupReconciler, ReconcilerConfig},
    db::{MemoryStackStore, StackStore},
    gateway::{MockGateway, WorkloadHandle},
    stack::{AdmissionLimits, CreateStackInput, ServiceConfig, StackError, StackService, StackStatus},
};
use stackd_networking::{NodePortRange, PortAllocator};
use tokio::sync::watch;

const POD: &str = "kind: Pod\nspec:\n  containers:\n    - name: app\n      image: registry.local/ctf/web:1\n";

struct Fixture {
    service: Arc<StackService>,
    store: Arc<MemoryStackStore>,
    gateway: Arc<MockGateway>,
    ports: Arc<PortAllocator>,
}

fn fixture(min: u16, max: u16, user_stack_limit: u32) -> Fixture {
    let store = Arc::new(MemoryStackStore::new());
    let gateway = Arc::new(MockGateway::new());
    let ports = Arc::new(PortAllocator::new(NodePortRange::new(min, max).unwrap()));
    let service = Arc::new(StackService::new(
        store.clone(),
        gateway.clone(),
        ports.clone(),
        AdmissionLimits { user_stack_limit },
        ServiceConfig::default(),
    ));
    Fixture {
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

#[tokio::test]
async fn test_two_port_range_scenario() {
    let fx = fixture(30000, 30001, 10);

    let first = fx.service.create(input(1, 1)).await.unwrap();
    let second = fx.service.create(input(2, 1)).await.unwrap();
    assert_eq!(first.node_port, 30000);
    assert_eq!(second.node_port, 30001);

    let err = fx.service.create(input(3, 1)).await.unwrap_err();
    assert!(matches!(err, StackError::NoAvailableNodePort));
    // The failed create left nothing behind.
    assert_eq!(fx.gateway.workload_count(), 2);

    fx.service.delete(first.id).await.unwrap();
    let third = fx.service.create(input(3, 1)).await.unwrap();
    assert_eq!(third.node_port, 30000);
}

#[tokio::test]
async fn test_recreate_after_delete() {
    let fx = fixture(31001, 31010, 10);

    let first = fx.service.create(input(1, 1)).await.unwrap();
    let err = fx.service.create(input(1, 1)).await.unwrap_err();
    assert!(matches!(err, StackError::UserProblemExists));

    fx.service.delete(first.id).await.unwrap();
    let again = fx.service.create(input(1, 1)).await.unwrap();
    assert_ne!(again.id, first.id);
}

#[tokio::test]
async fn test_limit_plus_one_is_exhausted() {
    let fx = fixture(31001, 31010, 3);

    for problem_id in 1..=3 {
        fx.service.create(input(5, problem_id)).await.unwrap();
    }
    let err = fx.service.create(input(5, 4)).await.unwrap_err();
    assert!(matches!(err, StackError::UserStackLimitReached { limit: 3 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_for_same_pair() {
    let fx = fixture(31001, 31100, 50);

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let service = fx.service.clone();
            tokio::spawn(async move { service.create(input(1, 1)).await })
        })
        .collect();

    let mut created = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(_) => created += 1,
            Err(StackError::UserProblemExists) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(created, 1);
    assert_eq!(fx.store.list_active().await.unwrap().len(), 1);
    // Losers released their ports and tore down their workloads.
    assert_eq!(fx.ports.usage().allocated, 1);
    assert_eq!(fx.gateway.workload_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_delete_races_expiry() {
    let fx = fixture(31001, 31010, 10);
    let stack = fx.service.create(input(1, 1)).await.unwrap();
    let reconciler = CleanupReconciler::new(fx.service.clone(), ReconcilerConfig::default());
    let (_tx, rx) = watch::channel(false);

    let later = stack.expires_at + chrono::Duration::seconds(1);
    let service = fx.service.clone();
    let delete = tokio::spawn(async move { service.delete(stack.id).await });
    let report = reconciler.cleanup_expired_and_orphaned_at(later, &rx).await;
    let deleted = delete.await.unwrap();

    // Exactly one path retired the stack.
    let expired_won = report.expired.succeeded == 1;
    assert_ne!(expired_won, deleted.is_ok());

    let stored = fx.store.get(stack.id).await.unwrap().unwrap();
    assert!(stored.status.is_terminal());
    assert!(!fx.ports.is_allocated(stack.node_port));
    assert_eq!(fx.ports.allocate().unwrap(), stack.node_port);
}

#[tokio::test]
async fn test_cleanup_converges_store_and_cluster() {
    let fx = fixture(31001, 31010, 10);
    let reconciler = CleanupReconciler::new(fx.service.clone(), ReconcilerConfig::default());
    let (_tx, rx) = watch::channel(false);

    let vanished = fx.service.create(input(1, 1)).await.unwrap();
    let healthy = fx.service.create(input(2, 1)).await.unwrap();
    fx.gateway.remove(&vanished.handle());
    let orphan = WorkloadHandle::from_name("stk-01arz3ndektsv4rrffq69g5fav");
    fx.gateway
        .insert_foreign(orphan.clone(), Utc::now() - chrono::Duration::hours(1));

    let report = reconciler.cleanup_expired_and_orphaned(&rx).await;

    assert_eq!(report.failures(), 0);
    assert_eq!(report.orphans_removed.succeeded, 1);
    assert_eq!(report.vanished_failed.succeeded, 1);
    assert!(!fx.gateway.contains(&orphan));

    let vanished_now = fx.store.get(vanished.id).await.unwrap().unwrap();
    let healthy_now = fx.store.get(healthy.id).await.unwrap().unwrap();
    assert_eq!(vanished_now.status, StackStatus::Failed);
    assert_eq!(healthy_now.status, StackStatus::Running);
    assert!(!fx.ports.is_allocated(vanished.node_port));
    assert!(fx.ports.is_allocated(healthy.node_port));

    // Everything left active is live, and everything live is active.
    let active = fx.store.list_active().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(fx.gateway.workload_count(), 1);
    assert!(fx.gateway.contains(&healthy.handle()));
}

#[tokio::test]
async fn test_pending_status_detail_is_not_an_error() {
    let fx = fixture(31001, 31010, 10);
    fx.gateway.set_start_ready(false);

    let stack = fx.service.create(input(1, 1)).await.unwrap();
    let detail = fx.service.get_status_detail(stack.id).await.unwrap();
    assert_eq!(detail.stack.status, StackStatus::Pending);
    assert_eq!(
        serde_json::to_value(detail.workload).unwrap(),
        serde_json::json!("pending")
    );
}
