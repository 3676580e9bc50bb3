use mirror::control::StateChangeRequest;
use mirror::error::ErrorKind;
use mirror::state::mirror::MirrorState;
use mirror::test_utils::mirror::{TestMirrorEnv, mirror_config, table_name};
use mirror_telemetry::metrics::init_metrics_handle;
use mirror_telemetry::tracing::init_test_tracing;
use std::time::Duration;

use crate::{row, seed_table, wait_until_caught_up};

#[tokio::test(flavor = "multi_thread")]
async fn running_mirror_streams_changes_until_paused() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &["1"]).await;

    let status = env
        .create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(status.destination_type, "faulty_memory");

    env.source.inner().insert(&users, row("2", 2)).await;
    env.source.inner().update(&users, row("1", 10)).await;
    wait_until_caught_up(&env, "users_mirror").await;

    // Without an initial snapshot only changes made after the mirror was created are mirrored.
    let rows = env.destination.inner().table_rows("users").await;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows["1"]["value"], 10);
    assert_eq!(rows["2"]["value"], 2);

    let status = env
        .controller
        .change_state(StateChangeRequest::pause("users_mirror"))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Paused);
    assert!(status.number_of_syncs >= 1);

    env.source.inner().insert(&users, row("3", 3)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        !env.destination
            .inner()
            .table_rows("users")
            .await
            .contains_key("3")
    );

    let status = env
        .controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    wait_until_caught_up(&env, "users_mirror").await;
    assert!(
        env.destination
            .inner()
            .table_rows("users")
            .await
            .contains_key("3")
    );

    assert_eq!(
        env.store.get_mirror_state_history("users_mirror").await,
        vec![
            MirrorState::Setup,
            MirrorState::Running,
            MirrorState::Pausing,
            MirrorState::Paused,
            MirrorState::Resuming,
            MirrorState::Running,
        ]
    );

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pausing_a_paused_mirror_changes_nothing() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    seed_table(&env, &table_name("public.users"), &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    for _ in 0..2 {
        let status = env
            .controller
            .change_state(StateChangeRequest::pause("users_mirror"))
            .await
            .unwrap();
        assert_eq!(status.current_state, MirrorState::Paused);
    }

    let history = env.store.get_mirror_state_history("users_mirror").await;
    assert_eq!(
        history
            .iter()
            .filter(|state| **state == MirrorState::Paused)
            .count(),
        1
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_destination_leaves_the_mirror_in_error_until_resumed() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.destination.fail_next_connects(1).await;

    let err = env
        .create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DestinationConnectionFailed);

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Error);

    // The source session opened before the destination failed was closed again.
    let source_stats = env.source.inner().connection_stats().await;
    assert_eq!(source_stats.connects, 1);
    assert_eq!(source_stats.open, 0);
    assert_eq!(env.destination.inner().connection_stats().await.connects, 0);

    let status = env
        .controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(env.destination.calls("connect").await, 2);

    env.source.inner().insert(&users, row("1", 1)).await;
    wait_until_caught_up(&env, "users_mirror").await;
    assert_eq!(env.destination.inner().table_rows("users").await.len(), 1);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unhealthy_destination_session_is_caught_before_the_loop_starts() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.destination.fail_next_health_checks(1).await;

    let err = env
        .create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DestinationConnectionFailed);

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Error);
    assert_eq!(status.checkpoint.position, None);
    // Nothing was set up on the source before the check failed.
    assert_eq!(env.source.inner().retention("users_mirror").await, None);
    assert_eq!(env.source.inner().connection_stats().await.open, 0);
    assert_eq!(env.destination.inner().connection_stats().await.open, 0);

    let status = env
        .controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(env.source.calls("health_check").await, 2);
    assert_eq!(env.destination.calls("health_check").await, 2);

    env.source.inner().insert(&users, row("1", 1)).await;
    wait_until_caught_up(&env, "users_mirror").await;
    assert_eq!(env.destination.inner().table_rows("users").await.len(), 1);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn transient_apply_failures_are_retried_from_the_same_checkpoint() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    env.destination
        .fail_next_applies([ErrorKind::DestinationConnectionFailed])
        .await;
    env.source.inner().insert(&users, row("1", 1)).await;
    env.wait_for_syncs("users_mirror", 1).await;

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(env.destination.inner().applied_events().await.len(), 1);
    assert!(env.destination.calls("apply_batch").await >= 2);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_apply_retries_move_the_mirror_to_error() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    env.destination
        .fail_next_applies([ErrorKind::DestinationConnectionFailed; 3])
        .await;
    env.source.inner().insert(&users, row("1", 1)).await;
    env.wait_for_state("users_mirror", MirrorState::Error).await;

    assert!(env.destination.inner().applied_events().await.is_empty());
    let stats = env.destination.inner().connection_stats().await;
    assert_eq!(stats.connects, stats.disconnects);

    // The batch is read again from the committed checkpoint on resume.
    env.controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    env.wait_for_syncs("users_mirror", 1).await;
    assert_eq!(env.destination.inner().applied_events().await.len(), 1);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_limit_pauses_the_mirror() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    env.controller
        .change_state(StateChangeRequest::pause("users_mirror"))
        .await
        .unwrap();

    let update = mirror::coordinator::ConfigUpdate {
        number_of_syncs: Some(2),
        ..Default::default()
    };
    env.controller
        .change_state(StateChangeRequest::edit(
            "users_mirror",
            update,
            MirrorState::Running,
        ))
        .await
        .unwrap();

    env.source.inner().insert(&users, row("1", 1)).await;
    env.wait_for_syncs("users_mirror", 1).await;
    env.source.inner().insert(&users, row("2", 2)).await;
    env.wait_for_state("users_mirror", MirrorState::Paused).await;

    env.source.inner().insert(&users, row("3", 3)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Paused);
    assert_eq!(status.number_of_syncs, 2);
    assert_eq!(env.destination.inner().table_rows("users").await.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_are_rejected() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    seed_table(&env, &table_name("public.users"), &[]).await;
    let config = mirror_config(&[("public.users", "users")]);

    env.create_mirror("users_mirror", config.clone(), false)
        .await
        .unwrap();
    let err = env
        .create_mirror("users_mirror", config.clone(), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MirrorAlreadyExists);

    let err = env
        .controller
        .change_state(StateChangeRequest::pause("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MirrorNotFound);

    let err = env
        .controller
        .change_state(StateChangeRequest {
            mirror_name: "users_mirror".to_string(),
            requested_state: MirrorState::Editing,
            config_update: None,
            drop_stats: false,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
    assert_eq!(err.mirror_name(), Some("users_mirror"));

    let mut invalid = config;
    invalid.batch_size = 0;
    let err = env
        .create_mirror("other_mirror", invalid, false)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationError);
    assert!(
        env.controller
            .mirror_status("other_mirror")
            .await
            .is_err()
    );

    let statuses = env.controller.list_mirrors().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].mirror_name, "users_mirror");

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn applied_batches_are_exported_as_metrics() {
    init_test_tracing();
    let metrics = init_metrics_handle().unwrap();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;

    env.create_mirror("metrics_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    env.source.inner().insert(&users, row("1", 1)).await;
    env.wait_for_syncs("metrics_mirror", 1).await;

    let rendered = metrics.render();
    assert!(rendered.contains(r#"mirror_batches_applied_total{mirror_name="metrics_mirror"}"#));
    assert!(rendered.contains(r#"mirror_events_applied_total{mirror_name="metrics_mirror"}"#));

    env.controller.shutdown().await;
}
