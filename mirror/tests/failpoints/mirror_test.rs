use mirror::control::StateChangeRequest;
use mirror::error::ErrorKind;
use mirror::failpoints::{
    APPLY_BATCH__AFTER_APPLY, APPLY_BATCH__BEFORE_APPLY, SNAPSHOT__AFTER_EXPORT,
    SNAPSHOT__BEFORE_DONE,
};
use mirror::state::mirror::MirrorState;
use mirror::state::table::{RetryPolicy, TableSyncPhase, TableSyncPhaseType};
use mirror::store::checkpoint::CheckpointStore;
use mirror::test_utils::failpoints::MirrorFailScenario;
use mirror::test_utils::mirror::{TestMirrorEnv, mirror_config, table_name};
use mirror_telemetry::tracing::init_test_tracing;

use crate::{row, seed_table, wait_until_caught_up};

#[tokio::test(flavor = "multi_thread")]
async fn batch_applied_without_committed_checkpoint_is_not_applied_again() {
    init_test_tracing();
    let _scenario = MirrorFailScenario::setup(&[(APPLY_BATCH__AFTER_APPLY, "1*return(no_retry)")]);

    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    env.source.inner().insert(&users, row("1", 1)).await;
    env.wait_for_state("users_mirror", MirrorState::Error).await;

    // The destination has the batch, the store never saw the checkpoint advance.
    let applied = env.destination.inner().checkpoint("users_mirror").await.unwrap();
    let stored = env
        .store
        .get_checkpoint_record("users_mirror")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(stored.checkpoint.as_ref(), Some(&applied));
    assert_eq!(stored.syncs_completed, 0);

    env.controller
        .change_state(StateChangeRequest::resume("users_mirror"))
        .await
        .unwrap();

    // Reconciling adopts the destination checkpoint instead of reading the batch again.
    env.store
        .notify_on_checkpoint_record("users_mirror", move |record| {
            record.checkpoint.as_ref() == Some(&applied)
        })
        .await
        .notified()
        .await;

    env.source.inner().insert(&users, row("2", 2)).await;
    wait_until_caught_up(&env, "users_mirror").await;

    let keys = env
        .destination
        .inner()
        .applied_events()
        .await
        .into_iter()
        .map(|event| event.change.key().to_string())
        .collect::<Vec<_>>();
    assert_eq!(keys, vec!["1", "2"]);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_apply_failures_are_retried_within_the_attempt_budget() {
    init_test_tracing();
    let _scenario =
        MirrorFailScenario::setup(&[(APPLY_BATCH__BEFORE_APPLY, "2*return(timed_retry)")]);

    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &[]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), false)
        .await
        .unwrap();

    env.source.inner().insert(&users, row("1", 1)).await;
    env.wait_for_syncs("users_mirror", 1).await;

    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.current_state, MirrorState::Running);
    assert_eq!(env.destination.inner().applied_events().await.len(), 1);

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshot_failing_before_completion_is_recopied_on_retry() {
    init_test_tracing();
    let scenario =
        MirrorFailScenario::setup(&[(SNAPSHOT__BEFORE_DONE, "1*return(manual_retry)")]);

    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &["1", "2", "3"]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), true)
        .await
        .unwrap();

    env.wait_for_phase("users_mirror", &users, TableSyncPhaseType::Errored)
        .await;
    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert_eq!(status.failed_tables[0].retry_policy, RetryPolicy::ManualRetry);

    // Rows copied by the failed attempt are not visible as merged changes.
    assert!(env.destination.inner().applied_events().await.is_empty());

    scenario.disable(SNAPSHOT__BEFORE_DONE);
    env.source.inner().update(&users, row("2", 20)).await;
    env.controller
        .retry_snapshot("users_mirror", "public.users")
        .await
        .unwrap();

    env.wait_for_phase("users_mirror", &users, TableSyncPhaseType::Merged)
        .await;
    wait_until_caught_up(&env, "users_mirror").await;

    assert_eq!(
        env.destination.inner().table_rows("users").await,
        env.source.inner().table_rows(&users).await
    );

    env.controller.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn registration_failure_without_retry_can_still_be_retried_manually() {
    init_test_tracing();
    let scenario = MirrorFailScenario::setup(&[(SNAPSHOT__AFTER_EXPORT, "return(no_retry)")]);

    let env = TestMirrorEnv::new().await;
    let users = table_name("public.users");
    seed_table(&env, &users, &["1"]).await;
    env.create_mirror("users_mirror", mirror_config(&[("public.users", "users")]), true)
        .await
        .unwrap();

    env.wait_for_phase("users_mirror", &users, TableSyncPhaseType::Errored)
        .await;
    let status = env.controller.mirror_status("users_mirror").await.unwrap();
    assert!(matches!(
        status.checkpoint.tables[&users],
        TableSyncPhase::Errored {
            retry_policy: RetryPolicy::NoRetry,
            ..
        }
    ));

    let err = env
        .controller
        .retry_snapshot("users_mirror", "public.users")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PartialSnapshotFailure);

    scenario.disable(SNAPSHOT__AFTER_EXPORT);
    env.controller
        .retry_snapshot("users_mirror", "public.users")
        .await
        .unwrap();
    env.wait_for_phase("users_mirror", &users, TableSyncPhaseType::Merged)
        .await;

    assert_eq!(env.destination.inner().table_rows("users").await.len(), 1);

    env.controller.shutdown().await;
}
