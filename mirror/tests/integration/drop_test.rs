use mirror::control::StateChangeRequest;
use mirror::error::ErrorKind;
use mirror::state::mirror::MirrorState;
use mirror::store::catalog::CatalogStore;
use mirror::store::checkpoint::CheckpointStore;
use mirror::test_utils::mirror::{TestMirrorEnv, mirror_config, table_name};
use mirror_telemetry::tracing::init_test_tracing;
use std::time::Duration;

use crate::{row, seed_table, wait_until_caught_up};

async fn synced_users_mirror(env: &TestMirrorEnv) {
    let users = table_name("public.users");
    seed_table(env, &users, &[]).await;

    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    env.source.inner().insert(&users, row("1", 1)).await;
    wait_until_caught_up(env, "users_mirror").await;
}

async fn assert_all_sessions_closed(env: &TestMirrorEnv) {
    let source_stats = env.source.inner().connection_stats().await;
    assert_eq!(source_stats.connects, source_stats.disconnects);
    assert_eq!(source_stats.open, 0);

    let destination_stats = env.destination.inner().connection_stats().await;
    assert_eq!(destination_stats.connects, destination_stats.disconnects);
    assert_eq!(destination_stats.open, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_keeps_statistics_unless_asked_to_delete_them() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    synced_users_mirror(&env).await;

    let status = env
        .controller
        .change_state(StateChangeRequest::drop("users_mirror", false))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Dropped);
    assert_eq!(status.number_of_syncs, 1);

    // The catalog forgets the mirror, its statistics stay.
    assert!(env.store.get_mirror("users_mirror").await.unwrap().is_none());
    let record = env
        .store
        .get_checkpoint_record("users_mirror")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.syncs_completed, 1);

    // Retention and destination checkpoint are released regardless.
    assert_eq!(env.source.inner().retention("users_mirror").await, None);
    assert_eq!(env.destination.inner().checkpoint("users_mirror").await, None);
    assert_all_sessions_closed(&env).await;

    assert_eq!(
        env.store.get_mirror_state_history("users_mirror").await,
        vec![
            MirrorState::Setup,
            MirrorState::Running,
            MirrorState::Dropping,
            MirrorState::Dropped,
        ]
    );

    let err = env
        .controller
        .mirror_status("users_mirror")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MirrorNotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_with_statistics_frees_the_name() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    synced_users_mirror(&env).await;

    let status = env
        .controller
        .change_state(StateChangeRequest::drop("users_mirror", true))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Dropped);
    assert_eq!(status.number_of_syncs, 0);
    assert!(
        env.store
            .get_checkpoint_record("users_mirror")
            .await
            .unwrap()
            .is_none()
    );

    let status = env
        .create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(status.number_of_syncs, 0);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_during_a_batch_lets_it_finish_and_closes_every_session_once() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    env.destination
        .delay_applies(Some(Duration::from_millis(300)))
        .await;
    env.source.inner().insert(&users, row("1", 1)).await;

    // Wait until the batch is on its way to the destination.
    while env.destination.calls("apply_batch").await == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let status = env
        .controller
        .change_state(StateChangeRequest::drop("users_mirror", false))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Dropped);

    // The in-flight batch was applied as a whole before the loop stopped.
    assert_eq!(env.destination.inner().applied_events().await.len(), 1);
    assert_eq!(env.destination.calls("apply_batch").await, 1);

    assert_eq!(
        env.destination.calls("connect").await,
        env.destination.calls("disconnect").await
    );
    assert_eq!(
        env.source.calls("connect").await,
        env.source.calls("disconnect").await
    );
    assert_all_sessions_closed(&env).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_of_an_errored_mirror_succeeds() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    seed_table(&env, &table_name("public.users"), &[]).await;
    env.source.fail_next_connects(1).await;

    let err = env
        .create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SourceConnectionFailed);

    let status = env
        .controller
        .change_state(StateChangeRequest::drop("users_mirror", true))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Dropped);
    assert_eq!(env.source.calls("drop_retention").await, 1);
    assert_eq!(env.destination.calls("drop_checkpoint").await, 1);
    assert_all_sessions_closed(&env).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_stops_running_snapshot_copies() {
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
    env.controller
        .change_state(StateChangeRequest::drop("users_mirror", false))
        .await
        .unwrap();

    assert!(env.source.inner().pinned_snapshots("users_mirror").await.is_empty());
    assert_all_sessions_closed(&env).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn drop_completes_while_both_peers_stay_unreachable() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    synced_users_mirror(&env).await;

    env.source.inner().set_reachable(false).await;
    env.destination.inner().set_reachable(false).await;
    env.source
        .inner()
        .insert(&table_name("public.users"), row("2", 2))
        .await;
    env.wait_for_state("users_mirror", MirrorState::Error).await;

    let status = env
        .controller
        .change_state(StateChangeRequest::drop("users_mirror", false))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Dropped);
    assert_eq!(status.number_of_syncs, 1);
    assert!(env.store.get_mirror("users_mirror").await.unwrap().is_none());

    let history = env.store.get_mirror_state_history("users_mirror").await;
    assert_eq!(
        history[history.len() - 3..],
        [MirrorState::Error, MirrorState::Dropping, MirrorState::Dropped]
    );

    // The peers could not be reached, their resources are left behind.
    assert!(env.source.inner().retention("users_mirror").await.is_some());
    assert!(env.destination.inner().checkpoint("users_mirror").await.is_some());
    assert_all_sessions_closed(&env).await;
}
