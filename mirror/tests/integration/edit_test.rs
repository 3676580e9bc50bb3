use mirror::control::StateChangeRequest;
use mirror::coordinator::{ConfigUpdate, TableMappingRequest};
use mirror::error::ErrorKind;
use mirror::state::mirror::MirrorState;
use mirror::state::table::{RetryPolicy, TableSyncPhaseType};
use mirror::test_utils::mirror::{TestMirrorEnv, mirror_config, table_name};
use mirror_telemetry::tracing::init_test_tracing;
use std::collections::HashSet;
use std::time::Duration;

use crate::{row, seed_table, wait_until_caught_up};

async fn paused_users_mirror(env: &TestMirrorEnv) {
    seed_table(env, &table_name("public.users"), &["1"]).await;

    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();
    env.controller
        .change_state(StateChangeRequest::pause("users_mirror"))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn edit_of_a_running_mirror_is_rejected() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    seed_table(&env, &table_name("public.users"), &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    let update = ConfigUpdate {
        batch_size: Some(500),
        ..Default::default()
    };
    let err = env
        .controller
        .change_state(StateChangeRequest::edit(
            "users_mirror",
            update,
            MirrorState::Running,
        ))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
    assert_eq!(
        err.description(),
        Some("Configuration can only be updated while the mirror is PAUSED")
    );

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(status.config.batch_size, 100);
    assert_eq!(status.staged_config, None);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn edit_is_applied_on_resume_and_added_table_waits_for_its_snapshot() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    let orders = table_name("public.orders");
    seed_table(&env, &users, &[]).await;
    seed_table(&env, &orders, &["o1", "o2"]).await;

    let mut config = mirror_config(&[("public.users", "users")]);
    config.idle_timeout_seconds = 60;
    env.create_mirror("users_mirror", config, false)
        .await
        .unwrap();
    env.controller
        .change_state(StateChangeRequest::pause("users_mirror"))
        .await
        .unwrap();

    env.source.fail_snapshot(&orders).await;
    let update = ConfigUpdate {
        batch_size: Some(500),
        idle_timeout_seconds: Some(10),
        additional_tables: vec![TableMappingRequest::new("public.orders", "orders")],
        ..Default::default()
    };
    let status = env
        .controller
        .change_state(StateChangeRequest::edit(
            "users_mirror",
            update,
            MirrorState::Paused,
        ))
        .await
        .unwrap();

    // The edit is staged, the current configuration is untouched until the mirror resumes.
    assert_eq!(status.current_state, MirrorState::Paused);
    assert_eq!(status.config.batch_size, 100);
    assert_eq!(status.config.idle_timeout_seconds, 60);
    let staged = status.staged_config.unwrap();
    assert_eq!(staged.batch_size, 500);
    assert_eq!(staged.idle_timeout_seconds, 10);
    assert!(staged.mapping_for("public.orders").is_some());

    env.wait_for_phase("users_mirror", &orders, TableSyncPhaseType::Errored)
        .await;

    for key in 0..500 {
        env.source
            .inner()
            .insert(&users, row(&format!("u{key}"), key))
            .await;
    }
    env.source.inner().insert(&orders, row("o3", 3)).await;

    let status = env
        .controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(status.config.batch_size, 500);
    assert_eq!(status.config.idle_timeout_seconds, 10);
    assert_eq!(status.staged_config, None);
    assert_eq!(status.failed_tables.len(), 1);
    assert_eq!(status.failed_tables[0].table, orders);
    assert_eq!(status.failed_tables[0].retry_policy, RetryPolicy::ManualRetry);

    // The first batch after the resume is filled up to the new batch size.
    env.wait_for_syncs("users_mirror", 1).await;
    assert_eq!(env.destination.inner().applied_batch_sizes().await, vec![500]);

    // Changes of a table whose snapshot did not complete never reach the destination.
    assert!(
        env.destination
            .inner()
            .applied_events()
            .await
            .iter()
            .all(|event| event.table == "users")
    );
    assert!(env.destination.inner().table_rows("orders").await.is_empty());

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn added_table_is_merged_without_losing_or_repeating_changes() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let orders = table_name("public.orders");
    paused_users_mirror(&env).await;
    seed_table(&env, &orders, &["o1", "o2", "o3"]).await;

    let update = ConfigUpdate {
        additional_tables: vec![TableMappingRequest::new("public.orders", "orders")],
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

    // Changes made while the snapshot is copied are replayed on top of it.
    env.source.inner().insert(&orders, row("o4", 4)).await;
    env.source.inner().update(&orders, row("o1", 10)).await;
    env.source.inner().delete(&orders, "o2").await;

    env.wait_for_phase("users_mirror", &orders, TableSyncPhaseType::Merged)
        .await;
    env.source.inner().insert(&orders, row("o5", 5)).await;
    wait_until_caught_up(&env, "users_mirror").await;

    assert_eq!(
        env.destination.inner().table_rows("orders").await,
        env.source.inner().table_rows(&orders).await
    );

    let applied = env.destination.inner().applied_events().await;
    let positions = applied
        .iter()
        .filter(|event| event.table == "orders")
        .map(|event| event.position)
        .collect::<Vec<_>>();
    let unique = positions.iter().collect::<HashSet<_>>();
    assert_eq!(positions.len(), unique.len());

    // The snapshot position was released once the table merged.
    assert!(
        env.source
            .inner()
            .pinned_snapshots("users_mirror")
            .await
            .is_empty()
    );

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_edits_leave_the_mirror_unchanged() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    paused_users_mirror(&env).await;

    let invalid_updates = [
        ConfigUpdate {
            batch_size: Some(0),
            ..Default::default()
        },
        ConfigUpdate {
            idle_timeout_seconds: Some(-1),
            ..Default::default()
        },
        ConfigUpdate {
            removed_tables: vec!["public.users".to_string()],
            ..Default::default()
        },
        ConfigUpdate {
            additional_tables: vec![TableMappingRequest::new("public.users", "users_copy")],
            ..Default::default()
        },
        ConfigUpdate {
            additional_tables: vec![TableMappingRequest::new("orders", "orders")],
            ..Default::default()
        },
        ConfigUpdate {
            batch_size: Some(500),
            additional_tables: vec![
                TableMappingRequest::new("public.orders", "orders"),
                TableMappingRequest::new("public.orders", "orders_copy"),
            ],
            ..Default::default()
        },
    ];

    for update in invalid_updates {
        let err = env
            .controller
            .change_state(StateChangeRequest::edit(
                "users_mirror",
                update.clone(),
                MirrorState::Paused,
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationError, "{update:?}");
    }

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Paused);
    assert_eq!(status.config, mirror_config(&[("public.users", "users")]));
    assert_eq!(status.staged_config, None);
    assert_eq!(status.checkpoint.tables.len(), 1);
    assert!(
        !env.store
            .get_mirror_state_history("users_mirror")
            .await
            .contains(&MirrorState::Editing)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn tracked_tables_only_grow_across_edits() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    paused_users_mirror(&env).await;

    for (source, destination) in [("public.orders", "orders"), ("public.items", "items")] {
        seed_table(&env, &table_name(source), &["1"]).await;

        let update = ConfigUpdate {
            additional_tables: vec![TableMappingRequest::new(source, destination)],
            ..Default::default()
        };
        let status = env
            .controller
            .change_state(StateChangeRequest::edit(
                "users_mirror",
                update,
                MirrorState::Paused,
            ))
            .await
            .unwrap();

        let staged = status.staged_config.unwrap();
        assert!(staged.mapping_for("public.users").is_some());
        assert!(staged.mapping_for(source).is_some());
    }

    let status = env
        .controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();
    let tracked = status
        .config
        .table_mappings
        .iter()
        .map(|mapping| mapping.source_table.to_string())
        .collect::<Vec<_>>();
    assert_eq!(tracked, vec!["public.users", "public.orders", "public.items"]);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn added_table_changes_wait_for_a_slow_snapshot_to_complete() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    let orders = table_name("public.orders");
    paused_users_mirror(&env).await;
    seed_table(&env, &orders, &["o1", "o2", "o3", "o4", "o5", "o6"]).await;

    // Three pages of two rows each, the copy outlives several polls of the running loop.
    env.source
        .delay_snapshot_pages(Some(Duration::from_millis(200)))
        .await;
    let update = ConfigUpdate {
        additional_tables: vec![TableMappingRequest::new("public.orders", "orders")],
        ..Default::default()
    };
    let status = env
        .controller
        .change_state(StateChangeRequest::edit(
            "users_mirror",
            update,
            MirrorState::Running,
        ))
        .await
        .unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert!(status.unregistered_tables.is_empty());
    let start = status.checkpoint.tables[&orders].snapshot_start().unwrap();

    env.source.inner().insert(&orders, row("o7", 7)).await;
    env.source.inner().update(&orders, row("o1", 10)).await;
    env.source.inner().insert(&users, row("2", 2)).await;
    env.wait_for_syncs("users_mirror", 1).await;

    // Users keep flowing while orders is still copied, none of its changes were applied.
    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(
        status.checkpoint.tables[&orders].as_type(),
        TableSyncPhaseType::Snapshotting
    );
    let applied = env.destination.inner().applied_events().await;
    assert!(applied.iter().any(|event| event.table == "users"));
    assert!(applied.iter().all(|event| event.table != "orders"));

    env.wait_for_phase("users_mirror", &orders, TableSyncPhaseType::Merged)
        .await;
    wait_until_caught_up(&env, "users_mirror").await;

    assert_eq!(
        env.destination.inner().table_rows("orders").await,
        env.source.inner().table_rows(&orders).await
    );
    let replayed = env
        .destination
        .inner()
        .applied_events()
        .await
        .into_iter()
        .filter(|event| event.table == "orders")
        .collect::<Vec<_>>();
    assert_eq!(replayed.len(), 2);
    assert!(replayed.iter().all(|event| event.position > start));

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn edit_reports_tables_it_could_not_register() {
    init_test_tracing();
    let env = TestMirrorEnv::new().await;
    let orders = table_name("public.orders");
    let items = table_name("public.items");
    paused_users_mirror(&env).await;
    // Orders does not exist on the source, its snapshot cannot be exported.
    seed_table(&env, &items, &["i1"]).await;

    let update = ConfigUpdate {
        additional_tables: vec![
            TableMappingRequest::new("public.orders", "orders"),
            TableMappingRequest::new("public.items", "items"),
        ],
        ..Default::default()
    };
    let status = env
        .controller
        .change_state(StateChangeRequest::edit(
            "users_mirror",
            update,
            MirrorState::Running,
        ))
        .await
        .unwrap();

    // The edit took effect, the failed table is reported and waits for a retry.
    assert_eq!(status.current_state, MirrorState::Running);
    assert!(status.config.mapping_for("public.orders").is_some());
    assert_eq!(status.unregistered_tables.len(), 1);
    assert_eq!(status.unregistered_tables[0].table, orders);
    assert!(
        status
            .failed_tables
            .iter()
            .any(|failed| failed.table == orders)
    );

    env.wait_for_phase("users_mirror", &items, TableSyncPhaseType::Merged)
        .await;

    // Once the table exists its snapshot can be retried.
    seed_table(&env, &orders, &["o1"]).await;
    let status = env
        .controller
        .retry_snapshot("users_mirror", "public.orders")
        .await
        .unwrap();
    assert!(status.unregistered_tables.is_empty());
    env.wait_for_phase("users_mirror", &orders, TableSyncPhaseType::Merged)
        .await;
    assert_eq!(env.destination.inner().table_rows("orders").await.len(), 1);

    env.controller.shutdown().await;
}
