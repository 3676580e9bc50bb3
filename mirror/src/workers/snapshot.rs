//! Snapshot and merge of tables added to a mirror.
//!
//! Onboarding a table happens in two steps. Registration exports a snapshot of the table, which
//! pins the source's change retention at the snapshot position, and persists the table as
//! snapshotting. Once every requested table is registered or failed, the edit that added them can
//! complete. The copy of the snapshot rows then runs in the background, bounded by
//! `max_snapshot_workers`, and marks the table snapshot-done. From there the running loop admits
//! the table, replays its changes after the snapshot position and merges it into the incremental
//! stream.

use metrics::counter;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, info, warn};

use crate::concurrency::future::reactive;
use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};
use crate::connector::{ConnectorHandle, Destination, Source};
use crate::error::{ErrorKind, MirrorError, MirrorResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{SNAPSHOT__AFTER_EXPORT, SNAPSHOT__BEFORE_DONE, mirror_fail_point};
use crate::metrics::{MIRROR_NAME_LABEL, MIRROR_SNAPSHOTS_COMPLETED_TOTAL, TABLE_NAME_LABEL};
use crate::state::checkpoint::CheckpointRecord;
use crate::state::table::{RetryPolicy, TableSyncPhase};
use crate::store::checkpoint::CheckpointStore;
use crate::types::{ControlPlaneConfig, MirrorConfig, Position, TableName};
use crate::workers::lifecycle::SnapshotLifecycleObserver;
use crate::workers::pool::SnapshotWorkerPool;
use crate::{bail, mirror_error};

/// Outcome of registering tables for snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotRegistration {
    /// Tables whose snapshot was exported, with the snapshot position.
    pub registered: Vec<(TableName, Position)>,
    /// Tables whose registration failed. They are errored and excluded until retried.
    pub failed: Vec<(TableName, MirrorError)>,
}

impl SnapshotRegistration {
    /// Returns a [`ErrorKind::PartialSnapshotFailure`] naming the failed tables, if any failed.
    pub fn partial_failure(&self) -> Option<MirrorError> {
        if self.failed.is_empty() {
            return None;
        }

        let tables = self
            .failed
            .iter()
            .map(|(table, err)| format!("{table} ({})", err.description().unwrap_or("unknown")))
            .collect::<Vec<_>>()
            .join(", ");

        Some(mirror_error!(
            ErrorKind::PartialSnapshotFailure,
            "Some tables could not be snapshotted",
            format!("The snapshot of the following tables failed and can be retried: {tables}")
        ))
    }
}

/// Runs the snapshots of the tables of one mirror.
///
/// Each snapshot copy owns its own connector handles. Progress is signaled through
/// [`SnapshotMergeWorkflow::subscribe`], which the running loop uses to admit tables without
/// waiting for its next idle timeout.
#[derive(Debug)]
pub struct SnapshotMergeWorkflow<S, D, St> {
    mirror_name: String,
    control_config: Arc<ControlPlaneConfig>,
    source: Arc<S>,
    destination: Arc<D>,
    store: St,
    pool: SnapshotWorkerPool,
    permits: Arc<Semaphore>,
    signal_tx: Arc<SignalTx>,
}

impl<S, D, St> SnapshotMergeWorkflow<S, D, St>
where
    S: Source + Send + Sync + 'static,
    D: Destination + Send + Sync + 'static,
    St: CheckpointStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        mirror_name: String,
        control_config: Arc<ControlPlaneConfig>,
        source: Arc<S>,
        destination: Arc<D>,
        store: St,
    ) -> Self {
        let (signal_tx, _) = create_signal();
        let permits = Arc::new(Semaphore::new(
            control_config.max_snapshot_workers.max(1) as usize,
        ));

        Self {
            mirror_name,
            control_config,
            source,
            destination,
            store,
            pool: SnapshotWorkerPool::new(),
            permits,
            signal_tx: Arc::new(signal_tx),
        }
    }

    /// Returns a receiver signaled whenever a table finished its snapshot, successfully or not.
    pub fn subscribe(&self) -> SignalRx {
        self.signal_tx.subscribe()
    }

    pub fn pool(&self) -> &SnapshotWorkerPool {
        &self.pool
    }

    /// Registers `tables` and starts copying the ones that registered.
    ///
    /// Returns once every table is registered or failed, the copies keep running.
    pub async fn start(&self, config: &MirrorConfig, tables: Vec<TableName>) -> SnapshotRegistration {
        let mut registration = self.register(tables).await;

        let not_started = self.spawn_copies(config, &registration.registered).await;
        registration
            .registered
            .retain(|(table, _)| !not_started.iter().any(|(failed, _)| failed == table));
        registration.failed.extend(not_started);

        registration
    }

    /// Restarts the snapshot of every table that did not complete it.
    ///
    /// Tables already snapshotting are registered again, which returns their existing snapshot
    /// position. Tables with a running copy are left alone.
    pub async fn resume(&self, config: &MirrorConfig) -> MirrorResult<SnapshotRegistration> {
        let record = self.get_checkpoint_record().await?;

        let mut tables = Vec::new();
        for (table, phase) in &record.tables {
            if phase.as_type().needs_snapshot() && !self.pool.has_active_worker(table).await {
                tables.push(table.clone());
            }
        }

        if tables.is_empty() {
            return Ok(SnapshotRegistration::default());
        }

        info!(
            mirror_name = %self.mirror_name,
            tables = tables.len(),
            "resuming unfinished table snapshots"
        );

        Ok(self.start(config, tables).await)
    }

    /// Re-runs the snapshot of the errored `table`.
    ///
    /// Fails with [`ErrorKind::InvalidState`] when the table is not errored or its timed retry is
    /// not due yet.
    pub async fn retry(
        &self,
        config: &MirrorConfig,
        table: &TableName,
    ) -> MirrorResult<SnapshotRegistration> {
        let record = self.get_checkpoint_record().await?;

        match record.tables.get(table) {
            Some(TableSyncPhase::Errored { retry_policy, .. }) => {
                if let RetryPolicy::TimedRetry { next_retry } = retry_policy
                    && !retry_policy.allows_retry()
                {
                    bail!(
                        ErrorKind::InvalidState,
                        "Table snapshot retry is not due yet",
                        format!("The snapshot of table {table} can be retried after {next_retry}")
                    );
                }
            }
            Some(phase) => bail!(
                ErrorKind::InvalidState,
                "Table snapshot did not fail",
                format!("The snapshot of table {table} cannot be retried in phase {phase}")
            ),
            None => bail!(
                ErrorKind::InvalidState,
                "Table is not tracked by the mirror",
                format!("Mirror {} has no table {table}", self.mirror_name)
            ),
        }

        // The failed copy persisted its outcome before returning, its worker may still be in the pool.
        self.pool.wait_for_worker(table).await;

        info!(mirror_name = %self.mirror_name, %table, "retrying table snapshot");

        self.store
            .update_table_phase(&self.mirror_name, table.clone(), TableSyncPhase::Pending)
            .await?;

        Ok(self.start(config, vec![table.clone()]).await)
    }

    /// Stops every running copy and waits for them.
    ///
    /// Stopped tables stay snapshotting and are resumed by [`SnapshotMergeWorkflow::resume`].
    pub async fn shutdown(&self) -> MirrorResult<()> {
        self.pool.shutdown().await
    }

    /// Waits for every running copy to end.
    pub async fn wait(&self) -> MirrorResult<()> {
        self.pool.wait_all().await
    }

    /// Exports the snapshot of each of `tables` and persists it as snapshotting.
    async fn register(&self, tables: Vec<TableName>) -> SnapshotRegistration {
        let observer = self.observer();
        let mut registration = SnapshotRegistration::default();

        let mut source = ConnectorHandle::source(self.source.clone());
        if let Err(err) = source.open().await {
            let err = err.with_mirror(&self.mirror_name);
            for table in tables {
                observer.mark_failed(table.clone(), &err).await;
                registration.failed.push((table, err.clone()));
            }

            return registration;
        }

        for table in tables {
            match self.export(&source, &table).await {
                Ok(start) => {
                    info!(mirror_name = %self.mirror_name, %table, %start, "table registered for snapshot");
                    registration.registered.push((table, start));
                }
                Err(err) => {
                    let err = err.with_mirror(&self.mirror_name);
                    observer.mark_failed(table.clone(), &err).await;
                    registration.failed.push((table, err));
                }
            }
        }

        source.close().await;

        registration
    }

    async fn export(&self, source: &ConnectorHandle<S>, table: &TableName) -> MirrorResult<Position> {
        let start = source.export_snapshot(&self.mirror_name, table).await?;

        #[cfg(feature = "failpoints")]
        mirror_fail_point(SNAPSHOT__AFTER_EXPORT)?;

        self.store
            .update_table_phase(
                &self.mirror_name,
                table.clone(),
                TableSyncPhase::Snapshotting { start },
            )
            .await?;

        Ok(start)
    }

    /// Spawns a copy worker for each registered table.
    ///
    /// Returns the tables whose copy could not be started.
    async fn spawn_copies(
        &self,
        config: &MirrorConfig,
        tables: &[(TableName, Position)],
    ) -> Vec<(TableName, MirrorError)> {
        let observer = self.observer();
        let mut not_started = Vec::new();

        for (table, start) in tables {
            let Some(mapping) = config.mapping_for(table.as_str()) else {
                let err = mirror_error!(
                    ErrorKind::InvalidState,
                    "Table is not mapped to a destination table",
                    format!("Table {table} was registered for snapshot but the mirror does not map it")
                )
                .with_mirror(&self.mirror_name);
                observer.mark_failed(table.clone(), &err).await;
                not_started.push((table.clone(), err));
                continue;
            };

            let copy = TableCopy {
                mirror_name: self.mirror_name.clone(),
                table: table.clone(),
                destination_table: mapping.destination_table.clone(),
                start: *start,
                batch_size: self.control_config.snapshot_batch_size.max(1),
                source: self.source.clone(),
                destination: self.destination.clone(),
                store: self.store.clone(),
                permits: self.permits.clone(),
                stop_rx: self.pool.stop_rx(),
                signal_tx: self.signal_tx.clone(),
            };

            let snapshot_worker_span = tracing::info_span!(
                "snapshot_worker",
                mirror_name = %self.mirror_name,
                table = %table,
                start = %start,
            );
            let mirror_name = self.mirror_name.clone();
            let worker = reactive(table.clone(), copy.run(), observer.clone(), move |panic| {
                mirror_error!(
                    ErrorKind::SnapshotWorkerPanic,
                    "Snapshot worker panicked",
                    panic
                )
                .with_mirror(&mirror_name)
            })
            .instrument(snapshot_worker_span.or_current());

            if !self.pool.spawn(table.clone(), worker).await {
                let err = mirror_error!(
                    ErrorKind::InvalidState,
                    "Snapshot copy is already running",
                    format!("A previous snapshot copy of table {table} has not finished yet")
                )
                .with_mirror(&self.mirror_name);
                not_started.push((table.clone(), err));
            }
        }

        not_started
    }

    fn observer(&self) -> SnapshotLifecycleObserver<St> {
        SnapshotLifecycleObserver::new(
            self.mirror_name.clone(),
            self.control_config.clone(),
            self.store.clone(),
            self.signal_tx.clone(),
        )
    }

    async fn get_checkpoint_record(&self) -> MirrorResult<CheckpointRecord> {
        self.store
            .get_checkpoint_record(&self.mirror_name)
            .await?
            .ok_or_else(|| {
                mirror_error!(
                    ErrorKind::InvalidState,
                    "Checkpoint record not found",
                    format!("Mirror {} has no checkpoint record", self.mirror_name)
                )
                .with_mirror(&self.mirror_name)
            })
    }
}

/// Copy of the snapshot rows of one table into its destination table.
struct TableCopy<S, D, St> {
    mirror_name: String,
    table: TableName,
    destination_table: String,
    start: Position,
    batch_size: usize,
    source: Arc<S>,
    destination: Arc<D>,
    store: St,
    permits: Arc<Semaphore>,
    stop_rx: SignalRx,
    signal_tx: Arc<SignalTx>,
}

impl<S, D, St> TableCopy<S, D, St>
where
    S: Source + Send + Sync + 'static,
    D: Destination + Send + Sync + 'static,
    St: CheckpointStore + Clone + Send + Sync + 'static,
{
    async fn run(self) -> MirrorResult<()> {
        let _permit = self.permits.clone().acquire_owned().await.map_err(|err| {
            mirror_error!(
                ErrorKind::InvalidState,
                "Snapshot workers are not accepting work",
                err
            )
        })?;

        if self.stop_requested() {
            info!("snapshot copy stopped before it started");
            return Ok(());
        }

        let mut source = ConnectorHandle::source(self.source.clone());
        let mut destination = ConnectorHandle::destination(self.destination.clone());

        let copied = self.copy_rows(&mut source, &mut destination).await;

        source.close().await;
        destination.close().await;

        let Some(rows) = copied? else {
            info!("snapshot copy stopped, the table stays snapshotting");
            return Ok(());
        };

        #[cfg(feature = "failpoints")]
        mirror_fail_point(SNAPSHOT__BEFORE_DONE)?;

        self.store
            .update_table_phase(
                &self.mirror_name,
                self.table.clone(),
                TableSyncPhase::SnapshotDone { start: self.start },
            )
            .await?;

        counter!(
            MIRROR_SNAPSHOTS_COMPLETED_TOTAL,
            MIRROR_NAME_LABEL => self.mirror_name.clone(),
            TABLE_NAME_LABEL => self.table.to_string()
        )
        .increment(1);

        info!(rows, "table snapshot copied");

        self.signal_tx.send_replace(());

        Ok(())
    }

    /// Replaces the destination table with the snapshot rows.
    ///
    /// Returns the number of copied rows, or `None` when a stop was requested between pages.
    async fn copy_rows(
        &self,
        source: &mut ConnectorHandle<S>,
        destination: &mut ConnectorHandle<D>,
    ) -> MirrorResult<Option<u64>> {
        source.open().await?;
        destination.open().await?;

        destination.truncate_table(&self.destination_table).await?;

        let mut rows_copied = 0u64;
        let mut after_key: Option<String> = None;
        loop {
            if self.stop_requested() {
                warn!(rows_copied, "stop requested during snapshot copy");
                return Ok(None);
            }

            let rows = source
                .read_snapshot(
                    &self.mirror_name,
                    &self.table,
                    after_key.as_deref(),
                    self.batch_size,
                )
                .await?;

            let Some(last) = rows.last() else {
                break;
            };
            after_key = Some(last.key.clone());

            let page_len = rows.len();
            destination
                .write_table_rows(&self.destination_table, rows)
                .await?;
            rows_copied += page_len as u64;

            debug!(rows_copied, "snapshot page copied");

            if page_len < self.batch_size {
                break;
            }
        }

        Ok(Some(rows_copied))
    }

    fn stop_requested(&self) -> bool {
        // A dropped pool counts as a stop.
        self.stop_rx.has_changed().unwrap_or(true)
    }
}
