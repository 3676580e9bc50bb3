use mirror::control::StateChangeRequest;
use mirror::state::mirror::MirrorState;
use mirror::state::table::TableSyncPhaseType;
use mirror::store::catalog::{CatalogStore, update_mirror_state};
use mirror::test_utils::mirror::{TestMirrorEnv, mirror_config, table_name};
use mirror_telemetry::tracing::init_test_tracing;
use std::time::Duration;

use crate::{row, seed_table, wait_until_caught_up};

#[tokio::test(flavor = "multi_thread")]
async fn recover_restarts_running_mirrors_and_keeps_paused_ones_paused() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    let orders = table_name("public.orders");
    seed_table(&env, &users, &[]).await;
    seed_table(&env, &orders, &[]).await;

    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    env.create_mirror("orders_mirror", mirror_config(&[("public.orders", "orders")]), false)
        .await
        .unwrap();
    env.controller
        .change_state(StateChangeRequest::pause("orders_mirror"))
        .await
        .unwrap();

    env.source.inner().insert(&users, row("1", 1)).await;
    wait_until_caught_up(&env, "users_mirror").await;

    // Shutting down leaves every mirror in its state.
    env.controller.shutdown().await;
    env.source.inner().insert(&users, row("2", 2)).await;
    env.source.inner().insert(&orders, row("o1", 1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(env.destination.inner().table_rows("users").await.len(), 1);

    let controller = env.restarted_controller();
    controller.recover().await.unwrap();

    wait_until_caught_up(&env, "users_mirror").await;
    assert_eq!(env.destination.inner().table_rows("users").await.len(), 2);

    let status = controller.mirror_status("orders_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Paused);
    assert!(env.destination.inner().table_rows("orders").await.is_empty());

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_settles_interrupted_requests() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    seed_table(&env, &table_name("public.users"), &[]).await;
    seed_table(&env, &table_name("public.orders"), &[]).await;

    for name in ["pausing_mirror", "dropping_mirror"] {
        env.create_mirror(name, mirror_config(&[("public.users", "users")]), false)
            .await
            .unwrap();
    }
    env.controller.shutdown().await;

    // Simulate requests interrupted by a crash of the control plane.
    update_mirror_state(&env.store, "pausing_mirror", MirrorState::Pausing)
        .await
        .unwrap();
    update_mirror_state(&env.store, "dropping_mirror", MirrorState::Dropping)
        .await
        .unwrap();

    let controller = env.restarted_controller();
    controller.recover().await.unwrap();

    let status = controller.mirror_status("pausing_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Paused);

    assert!(env.store.get_mirror("dropping_mirror").await.unwrap().is_none());
    assert_eq!(env.source.inner().retention("dropping_mirror").await, None);
    assert_eq!(
        env.store.get_mirror_state_history("dropping_mirror").await.last(),
        Some(&MirrorState::Dropped)
    );

    controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn recover_resumes_unfinished_snapshots() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &["1", "2", "3", "4", "5", "6"]).await;
    env.source
        .delay_snapshot_pages(Some(Duration::from_millis(50)))
        .await;

    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), true)
        .await
        .unwrap();
    env.controller.shutdown().await;

    let status = env.restarted_controller().mirror_status("users_mirror").await.unwrap();
    assert_eq!(
        status.checkpoint.tables[&users].as_type(),
        TableSyncPhaseType::Snapshotting
    );

    env.source.delay_snapshot_pages(None).await;
    let controller = env.restarted_controller();
    controller.recover().await.unwrap();

    env.wait_for_phase("users_mirror", &users, TableSyncPhaseType::Merged)
        .await;
    wait_until_caught_up(&env, "users_mirror").await;
    assert_eq!(
        env.destination.inner().table_rows("users").await,
        env.source.inner().table_rows(&users).await
    );

    controller.shutdown().await;
}
