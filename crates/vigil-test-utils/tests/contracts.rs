//! Lease contract tests.
//!
//! These tests validate the lease protocol contract between the lock store
//! and the acquirer when several processes share one storage backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use vigil_core::lease::LeaseAcquirer;
use vigil_test_utils::{InjectedFault, OpKind, TestContext};

const PERIOD: Duration = Duration::from_secs(30);

/// Contract: concurrent acquirers of one record produce exactly one holder.
#[tokio::test]
async fn contract_single_holder_under_contention() {
    let ctx = TestContext::new();
    let winners = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let acquirer = ctx.competitor();
            let winners = winners.clone();
            tokio::spawn(async move {
                let lease = acquirer
                    .acquire("locks/host/job", PERIOD, &format!("lease-{i}"))
                    .await
                    .expect("acquire");
                if lease.is_some() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("join");
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1, "exactly one holder");
}

/// Contract: a missing container costs one extra provisioning round.
#[tokio::test]
async fn contract_missing_container_is_provisioned_once() {
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    let acquirer = LeaseAcquirer::new(Arc::new(store.clone()));

    acquirer
        .acquire("locks/host/job", PERIOD, "lease-1")
        .await
        .expect("acquire")
        .expect("held");

    assert_eq!(store.count(OpKind::Acquire), 2);
    assert_eq!(store.count(OpKind::Create), 2);
    assert_eq!(store.count(OpKind::CreateContainer), 1);

    // The common path is a single round trip.
    store.clear_operations();
    acquirer
        .release("locks/host/job", "lease-1")
        .await
        .expect("release");
    acquirer
        .acquire("locks/host/job", PERIOD, "lease-2")
        .await
        .expect("acquire")
        .expect("held");
    assert_eq!(store.count(OpKind::Acquire), 1);
    assert_eq!(store.count(OpKind::Create), 0);
}

/// Contract: server errors during acquisition propagate unchanged.
#[tokio::test]
async fn contract_server_errors_propagate() {
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    store.inject(OpKind::Acquire, InjectedFault::Server, Some(1));
    let acquirer = LeaseAcquirer::new(Arc::new(store.clone()));

    let err = acquirer
        .acquire("locks/host/job", PERIOD, "lease-1")
        .await
        .expect_err("server error");
    assert!(err.is_transient());
    assert_eq!(store.count(OpKind::Create), 0);
}

/// Contract: a record created by someone else mid-flight reads as contention.
#[tokio::test]
async fn contract_create_race_is_contention() {
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    store.inject(OpKind::Acquire, InjectedFault::NotFound, Some(1));
    store.inject(OpKind::Create, InjectedFault::Conflict, Some(1));
    let acquirer = LeaseAcquirer::new(Arc::new(store.clone()));

    let lease = acquirer
        .acquire("locks/host/job", PERIOD, "lease-1")
        .await
        .expect("acquire");
    assert!(lease.is_none());
    assert_eq!(store.count(OpKind::Acquire), 1);
}

/// Contract: losing the lease between provisioning and the retried
/// acquisition reads as contention.
#[tokio::test]
async fn contract_conflict_after_provisioning_is_contention() {
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    store.inject(OpKind::Acquire, InjectedFault::NotFound, Some(1));
    store.inject(OpKind::Acquire, InjectedFault::Conflict, Some(1));
    let acquirer = LeaseAcquirer::new(Arc::new(store.clone()));

    let lease = acquirer
        .acquire("locks/host/job", PERIOD, "lease-1")
        .await
        .expect("acquire");

    assert!(lease.is_none());
    assert_eq!(store.count(OpKind::Acquire), 2);
    assert_eq!(store.count(OpKind::CreateContainer), 1);
    assert_eq!(store.count(OpKind::Create), 2);
    assert!(ctx.backend.has_container(&ctx.container));
}

/// Contract: a record created by someone else right after the container was
/// provisioned reads as contention, with no further acquisition attempt.
#[tokio::test]
async fn contract_create_race_after_provisioning_is_contention() {
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    store.inject_after(OpKind::Create, 1, InjectedFault::Conflict, Some(1));
    let acquirer = LeaseAcquirer::new(Arc::new(store.clone()));

    let lease = acquirer
        .acquire("locks/host/job", PERIOD, "lease-1")
        .await
        .expect("acquire");

    assert!(lease.is_none());
    assert_eq!(store.count(OpKind::Acquire), 1);
    assert_eq!(store.count(OpKind::CreateContainer), 1);
    assert_eq!(store.count(OpKind::Create), 2);
}

/// Contract: release tolerates records that vanished or changed hands.
#[tokio::test]
async fn contract_release_is_best_effort() {
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    let acquirer = LeaseAcquirer::new(Arc::new(store.clone()));

    store.inject(OpKind::Release, InjectedFault::NotFound, Some(1));
    acquirer
        .release("locks/host/job", "lease-1")
        .await
        .expect("not found is released");

    store.inject(OpKind::Release, InjectedFault::Fatal, Some(1));
    let err = acquirer
        .release("locks/host/job", "lease-1")
        .await
        .expect_err("fatal propagates");
    assert!(!err.is_conflict());
}
