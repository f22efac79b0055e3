//! Coordinator acquisition, release and owner lookup.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use vigil_singleton::prelude::*;
use vigil_test_utils::{OpKind, RecordingLockStore, TEST_CONTAINER, TestContext};

const HOST: &str = "testhost";
const OWNER: &str = "testinstance";
const EXTERNAL_PERIOD: Duration = Duration::from_secs(60);

struct Harness {
    ctx: TestContext,
    store: RecordingLockStore,
    coordinator: SingletonCoordinator,
}

fn harness(policy: SingletonPolicy) -> Harness {
    vigil_test_utils::init_test_logging();
    let ctx = TestContext::new();
    let store = ctx.recording_store();
    let manager = Arc::new(LockManager::with_store(Arc::new(store.clone())));
    let coordinator = SingletonCoordinator::new(
        manager,
        policy,
        Arc::new(FixedHostIdProvider::new(HOST).expect("host")),
    )
    .expect("coordinator")
    .with_instance_id(OWNER);

    Harness {
        ctx,
        store,
        coordinator,
    }
}

fn fast_policy() -> SingletonPolicy {
    SingletonPolicy {
        lock_period: Duration::from_millis(500),
        acquisition_poll_interval: Duration::from_millis(25),
        acquisition_timeout: Duration::from_millis(200),
        ..SingletonPolicy::default()
    }
}

fn testid() -> LockIdentity {
    LockIdentity::new("testid").expect("identity")
}

#[tokio::test(start_paused = true)]
async fn contended_lock_times_out_after_polling() {
    let h = harness(fast_policy());
    h.ctx
        .competitor()
        .acquire(&testid().path(), EXTERNAL_PERIOD, "external")
        .await
        .expect("acquire")
        .expect("held");

    let err = h
        .coordinator
        .lock(
            &testid(),
            Some(OWNER),
            &LockOptions::default(),
            &CancellationToken::new(),
            true,
        )
        .await
        .expect_err("timeout");

    assert!(matches!(err, Error::Timeout { .. }));
    let message = err.to_string();
    assert!(message.contains("testid"), "{message}");
    assert!(message.contains("0:00:00.2"), "{message}");

    let attempts = h.store.count(OpKind::Acquire);
    assert!((7..=10).contains(&attempts), "attempts = {attempts}");
}

#[tokio::test]
async fn no_retry_makes_one_attempt() {
    let h = harness(fast_policy());
    h.ctx
        .competitor()
        .acquire(&testid().path(), EXTERNAL_PERIOD, "external")
        .await
        .expect("acquire")
        .expect("held");

    let handle = h
        .coordinator
        .lock(
            &testid(),
            Some(OWNER),
            &LockOptions::default(),
            &CancellationToken::new(),
            false,
        )
        .await
        .expect("lock");

    assert!(handle.is_none());
    assert_eq!(h.store.count(OpKind::Acquire), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_succeeds_once_holder_releases() {
    let h = harness(SingletonPolicy {
        acquisition_timeout: Duration::from_secs(5),
        ..fast_policy()
    });
    let competitor = h.ctx.competitor();
    let path = testid().path();
    competitor
        .acquire(&path, EXTERNAL_PERIOD, "external")
        .await
        .expect("acquire")
        .expect("held");

    let releaser = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        competitor.release(&path, "external").await.expect("release");
    });

    let handle = h
        .coordinator
        .lock(
            &testid(),
            Some(OWNER),
            &LockOptions::default(),
            &CancellationToken::new(),
            true,
        )
        .await
        .expect("lock")
        .expect("held after release");
    releaser.await.expect("join");

    assert!(h.store.count(OpKind::Acquire) > 1);
    assert_eq!(
        h.coordinator.get_owner(&testid(), None).await.expect("owner"),
        Some(OWNER.to_string())
    );
    h.coordinator
        .release(handle, &CancellationToken::new())
        .await
        .expect("release");
}

#[tokio::test]
async fn first_lock_creates_container_record_and_owner() {
    let h = harness(SingletonPolicy::default());
    assert!(!h.ctx.backend.has_container(TEST_CONTAINER));

    let handle = h
        .coordinator
        .lock(
            &testid(),
            Some(OWNER),
            &LockOptions::default(),
            &CancellationToken::new(),
            false,
        )
        .await
        .expect("lock")
        .expect("held");

    assert!(h.ctx.backend.has_container(TEST_CONTAINER));
    assert_eq!(h.ctx.backend.object_count(TEST_CONTAINER), 1);
    assert_eq!(handle.lock_id(), &testid());
    assert_eq!(handle.lease_period(), Duration::from_secs(15));
    assert_eq!(
        h.ctx
            .competitor()
            .read_owner("locks/testid")
            .await
            .expect("owner"),
        Some(OWNER.to_string())
    );
    assert_eq!(h.store.count(OpKind::WriteMetadata), 1);

    h.coordinator
        .release(handle, &CancellationToken::new())
        .await
        .expect("release");
}

#[tokio::test]
async fn owner_is_optional() {
    let h = harness(SingletonPolicy::default());
    let handle = h
        .coordinator
        .lock(
            &testid(),
            None,
            &LockOptions::default(),
            &CancellationToken::new(),
            false,
        )
        .await
        .expect("lock")
        .expect("held");

    assert_eq!(h.store.count(OpKind::WriteMetadata), 0);
    assert_eq!(h.coordinator.get_owner(&testid(), None).await.expect("owner"), None);
    h.coordinator
        .release(handle, &CancellationToken::new())
        .await
        .expect("release");
}

#[tokio::test]
async fn get_owner_follows_lock_lifecycle() {
    let h = harness(SingletonPolicy::default());

    assert_eq!(h.coordinator.get_owner(&testid(), None).await.expect("owner"), None);
    assert!(
        !h.ctx.backend.has_container(TEST_CONTAINER),
        "owner lookup must not create anything"
    );

    let handle = h
        .coordinator
        .lock(
            &testid(),
            Some(OWNER),
            &LockOptions::default(),
            &CancellationToken::new(),
            false,
        )
        .await
        .expect("lock")
        .expect("held");
    assert_eq!(
        h.coordinator.get_owner(&testid(), None).await.expect("owner"),
        Some(OWNER.to_string())
    );

    h.coordinator
        .release(handle, &CancellationToken::new())
        .await
        .expect("release");
    assert_eq!(h.coordinator.get_owner(&testid(), None).await.expect("owner"), None);

    // The lease is observably free.
    let lease = h
        .ctx
        .competitor()
        .acquire("locks/testid", EXTERNAL_PERIOD, "next")
        .await
        .expect("acquire");
    assert_eq!(lease.as_deref(), Some("next"));
}

#[tokio::test]
async fn only_one_coordinator_holds_a_lock() {
    let h = harness(SingletonPolicy::default());
    let rivals: Vec<_> = (0..4)
        .map(|i| {
            let manager = Arc::new(LockManager::with_store(h.ctx.lease_store()));
            Arc::new(
                SingletonCoordinator::new(
                    manager,
                    SingletonPolicy::default(),
                    Arc::new(FixedHostIdProvider::new(HOST).expect("host")),
                )
                .expect("coordinator")
                .with_instance_id(format!("instance-{i}")),
            )
        })
        .collect();

    let attempts: Vec<_> = rivals
        .iter()
        .map(|coordinator| {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .lock(
                        &testid(),
                        Some(coordinator.instance_id()),
                        &LockOptions::default(),
                        &CancellationToken::new(),
                        false,
                    )
                    .await
                    .expect("lock")
            })
        })
        .collect();

    let mut held = Vec::new();
    for attempt in attempts {
        if let Some(handle) = attempt.await.expect("join") {
            held.push(handle);
        }
    }
    assert_eq!(held.len(), 1, "exactly one holder");

    let owner = h
        .coordinator
        .get_owner(&testid(), None)
        .await
        .expect("owner")
        .expect("owned");
    assert!(owner.starts_with("instance-"));
}

#[tokio::test(start_paused = true)]
async fn cancellation_aborts_polling() {
    let h = harness(SingletonPolicy {
        acquisition_timeout: Duration::from_secs(30),
        ..fast_policy()
    });
    h.ctx
        .competitor()
        .acquire(&testid().path(), EXTERNAL_PERIOD, "external")
        .await
        .expect("acquire")
        .expect("held");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = h
        .coordinator
        .lock(&testid(), Some(OWNER), &LockOptions::default(), &cancel, true)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled { .. }));
    assert!(h.store.count(OpKind::Acquire) < 10);
}

#[tokio::test]
async fn pre_cancelled_lock_makes_no_attempt() {
    let h = harness(SingletonPolicy::default());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h
        .coordinator
        .lock(&testid(), None, &LockOptions::default(), &cancel, true)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(h.store.count(OpKind::Acquire), 0);
}

#[tokio::test]
async fn cancelled_release_still_releases() {
    let h = harness(SingletonPolicy::default());
    let handle = h
        .coordinator
        .lock(
            &testid(),
            Some(OWNER),
            &LockOptions::default(),
            &CancellationToken::new(),
            false,
        )
        .await
        .expect("lock")
        .expect("held");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .coordinator
        .release(handle, &cancel)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled { .. }));
    assert_eq!(h.store.count(OpKind::Release), 1);
    assert_eq!(h.coordinator.get_owner(&testid(), None).await.expect("owner"), None);
}

#[tokio::test]
async fn storage_errors_during_acquisition_propagate() {
    let h = harness(SingletonPolicy::default());
    h.store
        .inject(OpKind::Acquire, vigil_test_utils::InjectedFault::Server, Some(1));

    let err = h
        .coordinator
        .lock(
            &testid(),
            None,
            &LockOptions::default(),
            &CancellationToken::new(),
            true,
        )
        .await
        .expect_err("server error");
    assert!(err.is_transient());
}

#[tokio::test]
async fn accounts_are_selected_by_name() {
    vigil_test_utils::init_test_logging();
    let primary = TestContext::new();
    let secondary = TestContext::new();
    let provider = StaticLockStoreProvider::new(primary.lease_store())
        .with_account("secondary", secondary.lease_store());
    let coordinator = SingletonCoordinator::new(
        Arc::new(LockManager::new(Arc::new(provider))),
        SingletonPolicy::default(),
        Arc::new(FixedHostIdProvider::new(HOST).expect("host")),
    )
    .expect("coordinator");

    let options = LockOptions {
        account: Some("secondary".to_string()),
        ..LockOptions::default()
    };
    let handle = coordinator
        .lock(&testid(), Some(OWNER), &options, &CancellationToken::new(), false)
        .await
        .expect("lock")
        .expect("held");

    assert_eq!(handle.account(), "secondary");
    assert!(secondary.backend.has_container(TEST_CONTAINER));
    assert!(!primary.backend.has_container(TEST_CONTAINER));
    assert_eq!(
        coordinator
            .get_owner(&testid(), Some("secondary"))
            .await
            .expect("owner"),
        Some(OWNER.to_string())
    );
    coordinator
        .release(handle, &CancellationToken::new())
        .await
        .expect("release");

    let err = coordinator
        .get_owner(&testid(), Some("unknown"))
        .await
        .expect_err("unknown account");
    assert!(matches!(err, Error::Configuration { .. }));
}
