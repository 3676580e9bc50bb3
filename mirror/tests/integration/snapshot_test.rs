use mirror::control::StateChangeRequest;
use mirror::error::ErrorKind;
use mirror::state::mirror::MirrorState;
use mirror::state::table::{TableSyncPhase, TableSyncPhaseType};
use mirror::test_utils::mirror::{TestMirrorEnv, mirror_config, table_name};
use mirror_telemetry::tracing::init_test_tracing;

use crate::{row, seed_table, wait_until_caught_up};

#[tokio::test(flavor = "multi_thread")]
async fn initial_snapshot_copies_existing_rows_before_streaming() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    let orders = table_name("public.orders");
    seed_table(&env, &users, &["1", "2", "3", "4", "5"]).await;
    seed_table(&env, &orders, &["o1"]).await;

    let status = env
        .create_mirror(
            "shop_mirror",
            mirror_config(&[("public.users", "users"), ("public.orders", "orders")]),
            true,
        )
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert!(status.failed_tables.is_empty());

    env.source.inner().update(&users, row("1", 100)).await;

    env.wait_for_phase("shop_mirror", &users, TableSyncPhaseType::Merged)
        .await;
    env.wait_for_phase("shop_mirror", &orders, TableSyncPhaseType::Merged)
        .await;
    wait_until_caught_up(&env, "shop_mirror").await;

    assert_eq!(
        env.destination.inner().table_rows("users").await,
        env.source.inner().table_rows(&users).await
    );
    assert_eq!(
        env.destination.inner().table_rows("orders").await,
        env.source.inner().table_rows(&orders).await
    );
    // Snapshot rows are written in pages of the configured snapshot batch size.
    assert_eq!(env.destination.calls("write_table_rows").await, 4);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_table_snapshot_does_not_hold_back_the_other_tables() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    let orders = table_name("public.orders");
    seed_table(&env, &users, &["1", "2"]).await;
    seed_table(&env, &orders, &["o1", "o2", "o3"]).await;
    env.source.fail_snapshot(&orders).await;

    env.create_mirror(
        "shop_mirror",
        mirror_config(&[("public.users", "users"), ("public.orders", "orders")]),
        true,
    )
    .await
    .unwrap();

    env.wait_for_phase("shop_mirror", &orders, TableSyncPhaseType::Errored)
        .await;
    env.wait_for_phase("shop_mirror", &users, TableSyncPhaseType::Merged)
        .await;

    env.source.inner().insert(&users, row("3", 3)).await;
    env.source.inner().insert(&orders, row("o4", 4)).await;
    wait_until_caught_up(&env, "shop_mirror").await;

    assert_eq!(env.destination.inner().table_rows("users").await.len(), 3);
    assert!(env.destination.inner().table_rows("orders").await.is_empty());

    let status = env.controller.mirror_status("shop_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(status.failed_tables.len(), 1);
    assert_eq!(status.failed_tables[0].table, orders);
    assert!(status.failed_tables[0].solution.is_some());

    // A table that did not fail cannot be retried.
    let err = env
        .controller
        .retry_snapshot("shop_mirror", "public.users")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    env.source.heal_snapshot(&orders).await;
    let status = env
        .controller
        .retry_snapshot("shop_mirror", "public.orders")
        .await
        .unwrap();
    assert!(status.failed_tables.is_empty());

    env.wait_for_phase("shop_mirror", &orders, TableSyncPhaseType::Merged)
        .await;
    wait_until_caught_up(&env, "shop_mirror").await;
    assert_eq!(
        env.destination.inner().table_rows("orders").await,
        env.source.inner().table_rows(&orders).await
    );

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn tables_that_cannot_be_registered_are_reported_on_retry() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    let missing = table_name("public.missing");
    seed_table(&env, &users, &["1"]).await;

    // Registration failures of some tables do not fail the creation of the mirror.
    env.create_mirror(
        "shop_mirror",
        mirror_config(&[("public.users", "users"), ("public.missing", "missing")]),
        true,
    )
    .await
    .unwrap();

    env.wait_for_phase("shop_mirror", &users, TableSyncPhaseType::Merged)
        .await;
    env.wait_for_phase("shop_mirror", &missing, TableSyncPhaseType::Errored)
        .await;

    let err = env
        .controller
        .retry_snapshot("shop_mirror", "public.missing")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialSnapshotFailure);
    assert!(err.detail().is_some_and(|detail| detail.contains("public.missing")));

    let status = env.controller.mirror_status("shop_mirror").await.unwrap();
    assert!(matches!(
        status.checkpoint.tables[&missing],
        TableSyncPhase::Errored { .. }
    ));

    let err = env
        .controller
        .retry_snapshot("shop_mirror", "public.unknown")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshots_of_a_paused_mirror_complete_and_merge_on_resume() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &["1", "2", "3"]).await;

    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), true)
        .await
        .unwrap();
    env.controller
        .change_state(StateChangeRequest::pause("users_mirror"))
        .await
        .unwrap();

    // The copy keeps running while paused, merging needs the running loop.
    env.store
        .notify_on_table_phase_matching("users_mirror", &users, |phase| {
            matches!(
                phase.as_type(),
                TableSyncPhaseType::SnapshotDone | TableSyncPhaseType::Merged
            )
        })
        .await
        .notified()
        .await;
    env.source.inner().insert(&users, row("4", 4)).await;

    env.controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    env.wait_for_phase("users_mirror", &users, TableSyncPhaseType::Merged)
        .await;
    wait_until_caught_up(&env, "users_mirror").await;

    assert_eq!(env.destination.inner().table_rows("users").await.len(), 4);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_of_a_dropped_mirror_is_rejected() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    seed_table(&env, &table_name("public.users"), &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    env.controller
        .change_state(StateChangeRequest::drop("users_mirror", true))
        .await
        .unwrap();

    let err = env
        .controller
        .retry_snapshot("users_mirror", "public.users")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MirrorNotFound);
}
