use metrics::counter;
use std::sync::Arc;
use tracing::{debug, error};

use crate::concurrency::future::ReactiveFutureCallback;
use crate::concurrency::signal::SignalTx;
use crate::error::MirrorError;
use crate::metrics::{
    ERROR_KIND_LABEL, MIRROR_NAME_LABEL, MIRROR_SNAPSHOT_FAILURES_TOTAL, TABLE_NAME_LABEL,
};
use crate::state::table::{RetryPolicy, TableSnapshotError};
use crate::store::checkpoint::CheckpointStore;
use crate::types::{ControlPlaneConfig, TableName};

/// Observes the outcome of snapshot workers.
///
/// A failed or panicked worker leaves its table errored with a retry policy derived from the
/// failure. Observers never fail themselves: a failure to persist the error is logged.
#[derive(Debug, Clone)]
pub struct SnapshotLifecycleObserver<St> {
    mirror_name: String,
    config: Arc<ControlPlaneConfig>,
    store: St,
    signal_tx: Arc<SignalTx>,
}

impl<St> SnapshotLifecycleObserver<St>
where
    St: CheckpointStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        mirror_name: String,
        config: Arc<ControlPlaneConfig>,
        store: St,
        signal_tx: Arc<SignalTx>,
    ) -> Self {
        Self {
            mirror_name,
            config,
            store,
            signal_tx,
        }
    }

    /// Marks `table` as errored because of `error`.
    pub async fn mark_failed(&self, table: TableName, error: &MirrorError) {
        counter!(
            MIRROR_SNAPSHOT_FAILURES_TOTAL,
            MIRROR_NAME_LABEL => self.mirror_name.clone(),
            TABLE_NAME_LABEL => table.to_string(),
            ERROR_KIND_LABEL => format!("{:?}", error.kind())
        )
        .increment(1);

        let table_error = TableSnapshotError::from_mirror_error(&self.config, table, error);
        self.mark_table_errored(table_error).await;
    }

    /// Persists the errored phase of the table in `table_error`.
    async fn mark_table_errored(&self, table_error: TableSnapshotError) {
        let table = table_error.table().clone();
        error!(
            mirror_name = %self.mirror_name,
            %table,
            retry_policy = ?table_error.retry_policy(),
            "table snapshot failed"
        );

        if let Err(err) = self
            .store
            .update_table_phase(&self.mirror_name, table.clone(), table_error.into())
            .await
        {
            error!("an error occurred while marking table {table} as failed: {err}");
            return;
        }

        // Status readers and the running loop observe the failure without polling.
        self.signal_tx.send_replace(());
    }
}

impl<St> ReactiveFutureCallback<TableName, MirrorError> for SnapshotLifecycleObserver<St>
where
    St: CheckpointStore + Clone + Send + Sync + 'static,
{
    async fn on_complete(&mut self, id: TableName) {
        debug!(mirror_name = %self.mirror_name, table = %id, "snapshot worker finished");
    }

    async fn on_error(&mut self, id: TableName, error: MirrorError) {
        self.mark_failed(id, &error).await;
    }

    async fn on_panic(&mut self, id: TableName, panic: String) {
        counter!(
            MIRROR_SNAPSHOT_FAILURES_TOTAL,
            MIRROR_NAME_LABEL => self.mirror_name.clone(),
            TABLE_NAME_LABEL => id.to_string(),
            ERROR_KIND_LABEL => "SnapshotWorkerPanic"
        )
        .increment(1);

        let table_error = TableSnapshotError::without_solution(
            id,
            format!("The snapshot worker has experienced a panic: {panic}"),
            RetryPolicy::NoRetry,
        );
        self.mark_table_errored(table_error).await;
    }
}
