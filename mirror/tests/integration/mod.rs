use mirror::test_utils::mirror::TestMirrorEnv;
use mirror::types::{TableName, TableRow};
use serde_json::json;

mod drop_test;
mod edit_test;
mod lifecycle_test;
mod recovery_test;
mod snapshot_test;

pub fn row(key: &str, value: u64) -> TableRow {
    TableRow::new(key, json!({ "id": key, "value": value }))
}

/// Creates `table` in the source of `env` and inserts one row per key.
pub async fn seed_table(env: &TestMirrorEnv, table: &TableName, keys: &[&str]) {
    env.source.inner().create_table(table).await;
    for (value, key) in keys.iter().enumerate() {
        env.source.inner().insert(table, row(key, value as u64)).await;
    }
}

/// Waits until the checkpoint of mirror `name` reached the current source head.
pub async fn wait_until_caught_up(env: &TestMirrorEnv, name: &str) {
    let head = env.source.inner().head().await;

    env.store
        .notify_on_checkpoint_record(name, move |record| {
            record
                .checkpoint
                .as_ref()
                .is_some_and(|checkpoint| checkpoint.position >= head)
        })
        .await
        .notified()
        .await;
}
