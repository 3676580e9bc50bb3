use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, warn};

use crate::concurrency::control::{DirectiveRx, LoopDirective};
use crate::concurrency::future::optional_future;
use crate::concurrency::signal::SignalRx;
use crate::connector::{ConnectorHandle, Destination, Source};
use crate::error::{ErrorKind, MirrorResult};
#[cfg(feature = "failpoints")]
use crate::failpoints::{APPLY_BATCH__AFTER_APPLY, APPLY_BATCH__BEFORE_APPLY, mirror_fail_point};
use crate::metrics::{
    ERROR_KIND_LABEL, MIRROR_APPLY_FAILURES_TOTAL, MIRROR_BATCHES_APPLIED_TOTAL,
    MIRROR_CHECKPOINT_POSITION, MIRROR_EVENTS_APPLIED_TOTAL, MIRROR_NAME_LABEL,
};
use crate::state::checkpoint::{Checkpoint, CheckpointRecord, TableCursor};
use crate::state::mirror::MirrorState;
use crate::state::table::{TableSyncPhase, TableSyncPhaseType};
use crate::store::catalog::{CatalogStore, update_mirror_state};
use crate::store::checkpoint::{CheckpointCommit, CheckpointStore};
use crate::types::{
    ChangeEvent, ControlPlaneConfig, DestinationEvent, MirrorConfig, TableName,
};
use crate::{bail, mirror_error};

/// How a running loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorExit {
    /// A pause was requested, the mirror is paused.
    Paused,
    /// The sync limit of the run was reached and the mirror paused itself.
    SyncLimitReached,
    /// A stop was requested, the mirror state is left to the requester.
    Stopped,
}

/// Handle for monitoring the running loop of a mirror.
#[derive(Debug)]
pub struct MirrorWorkerHandle {
    handle: Option<JoinHandle<MirrorResult<MirrorExit>>>,
}

impl MirrorWorkerHandle {
    /// Returns `true` once the loop has ended.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|handle| handle.is_finished())
    }

    /// Waits for the running loop to end.
    ///
    /// Both connector handles of the loop are closed and its final state persisted by the time
    /// this returns, unless the loop panicked.
    pub async fn wait(mut self) -> MirrorResult<MirrorExit> {
        let Some(handle) = self.handle.take() else {
            return Ok(MirrorExit::Stopped);
        };

        handle.await.map_err(|err| {
            mirror_error!(
                ErrorKind::MirrorWorkerPanic,
                "Mirror worker panicked",
                err
            )
        })?
    }
}

/// Events read for one batch and the checkpoint the batch advances to.
#[derive(Debug)]
struct CollectedBatch {
    events: Vec<ChangeEvent>,
    target: Checkpoint,
    merged: Vec<TableName>,
}

/// Why a wait of the running loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Directive,
    Snapshot,
    Timeout,
}

/// Worker running the incremental stream of one mirror.
///
/// The worker owns the connector handles of the mirror for as long as it runs. Each cycle it reads
/// up to `batch_size` events or waits up to the idle timeout, applies them together with the
/// advanced checkpoint, and only then commits the checkpoint to the store. Pause and stop
/// directives are observed between batches, a batch is either applied as a whole or discarded
/// before it reaches the destination.
#[derive(Debug)]
pub struct MirrorWorker<S, D, St> {
    mirror_name: String,
    config: Arc<MirrorConfig>,
    control_config: Arc<ControlPlaneConfig>,
    sync_limit: u64,
    source: Arc<S>,
    destination: Arc<D>,
    store: St,
    directive_rx: DirectiveRx,
    directive_closed: bool,
    snapshot_rx: Option<SignalRx>,
}

impl<S, D, St> MirrorWorker<S, D, St> {
    /// Creates a worker running `mirror_name` with `config`.
    ///
    /// A non-zero `sync_limit` pauses the mirror after that many non-empty batches. When
    /// `snapshot_rx` is given, the worker admits snapshotted tables as soon as it is signaled.
    #[expect(clippy::too_many_arguments)]
    pub fn new(
        mirror_name: String,
        config: Arc<MirrorConfig>,
        control_config: Arc<ControlPlaneConfig>,
        sync_limit: u64,
        source: Arc<S>,
        destination: Arc<D>,
        store: St,
        directive_rx: DirectiveRx,
        snapshot_rx: Option<SignalRx>,
    ) -> Self {
        Self {
            mirror_name,
            config,
            control_config,
            sync_limit,
            source,
            destination,
            store,
            directive_rx,
            directive_closed: false,
            snapshot_rx,
        }
    }
}

impl<S, D, St> MirrorWorker<S, D, St>
where
    S: Source + Send + Sync + 'static,
    D: Destination + Send + Sync + 'static,
    St: CatalogStore + CheckpointStore + Clone + Send + Sync + 'static,
{
    /// Opens the connectors of the mirror, moves it to [`MirrorState::Running`] and spawns its
    /// running loop.
    ///
    /// When opening or reconciling fails, both handles are closed, the mirror is moved to
    /// [`MirrorState::Error`] and the error is returned.
    pub async fn start(self) -> MirrorResult<MirrorWorkerHandle> {
        info!(mirror_name = %self.mirror_name, "starting mirror worker");

        let mirror_worker_span = tracing::info_span!(
            "mirror_worker",
            mirror_name = %self.mirror_name,
            batch_size = self.config.batch_size,
            idle_timeout_seconds = self.config.idle_timeout_seconds,
        );

        let mut source = ConnectorHandle::source(self.source.clone());
        let mut destination = ConnectorHandle::destination(self.destination.clone());

        let prepared = self
            .prepare(&mut source, &mut destination)
            .instrument(mirror_worker_span.clone())
            .await;
        let checkpoint = match prepared {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                source.close().await;
                destination.close().await;

                let err = err.with_mirror(&self.mirror_name);
                self.settle(&Err(err.clone())).await;

                return Err(err);
            }
        };

        let mut worker = self;
        let mirror_worker = async move {
            let result = worker
                .run(&source, &destination, checkpoint)
                .await
                .map_err(|err| err.with_mirror(&worker.mirror_name));

            source.close().await;
            destination.close().await;
            worker.settle(&result).await;

            result
        }
        .instrument(mirror_worker_span.or_current());

        let handle = tokio::spawn(mirror_worker);

        Ok(MirrorWorkerHandle {
            handle: Some(handle),
        })
    }

    /// Opens both connectors and determines the checkpoint the loop starts from.
    async fn prepare(
        &self,
        source: &mut ConnectorHandle<S>,
        destination: &mut ConnectorHandle<D>,
    ) -> MirrorResult<Checkpoint> {
        source.open().await?;
        destination.open().await?;
        source.health_check().await?;
        destination.health_check().await?;

        let record = self.get_checkpoint_record().await?;
        let retention_start = source.create_retention(&self.mirror_name).await?;
        let applied = destination.read_checkpoint(&self.mirror_name).await?;

        let checkpoint = match (record.checkpoint.clone(), applied) {
            (Some(stored), Some(applied)) if stored == applied => stored,
            // A batch was applied but its commit to the store was lost, the destination wins.
            (stored, Some(applied)) => {
                warn!(
                    stored_position = ?stored.as_ref().map(|checkpoint| checkpoint.position),
                    applied_position = %applied.position,
                    "destination checkpoint differs from the stored one, adopting the destination checkpoint"
                );

                let table_phases = newly_merged_tables(&record, &applied)
                    .into_iter()
                    .map(|table| (table, TableSyncPhase::Merged))
                    .collect::<Vec<_>>();
                for (table, _) in &table_phases {
                    source.release_snapshot(&self.mirror_name, table).await?;
                }

                self.store
                    .commit_checkpoint(
                        &self.mirror_name,
                        CheckpointCommit {
                            expected: stored,
                            checkpoint: applied.clone(),
                            table_phases,
                            synced: false,
                        },
                    )
                    .await?;

                applied
            }
            (Some(stored), None) => stored,
            (None, None) => {
                let checkpoint = Checkpoint::new(
                    retention_start,
                    record
                        .tables_in(TableSyncPhaseType::Merged)
                        .map(|(table, _)| table.clone()),
                );

                self.store
                    .commit_checkpoint(
                        &self.mirror_name,
                        CheckpointCommit {
                            expected: None,
                            checkpoint: checkpoint.clone(),
                            table_phases: vec![],
                            synced: false,
                        },
                    )
                    .await?;

                info!(position = %retention_start, "mirror checkpoint established");

                checkpoint
            }
        };

        update_mirror_state(&self.store, &self.mirror_name, MirrorState::Running).await?;
        info!(position = %checkpoint.position, "mirror worker started");

        Ok(checkpoint)
    }

    async fn run(
        &mut self,
        source: &ConnectorHandle<S>,
        destination: &ConnectorHandle<D>,
        mut checkpoint: Checkpoint,
    ) -> MirrorResult<MirrorExit> {
        let mut syncs = 0;

        loop {
            if let Some(exit) = self.requested_exit() {
                info!(?exit, "mirror worker exiting on request");
                return Ok(exit);
            }

            let working = self.admit_snapshotted_tables(&checkpoint).await?;
            let Some(batch) = self.collect_batch(source, &working).await? else {
                // The batch was discarded before reaching the destination.
                continue;
            };

            if batch.events.is_empty() && batch.target == checkpoint {
                self.wait(self.control_config.poll_interval()).await;
                continue;
            }

            let events_count = batch.events.len();
            let events = self.map_events(batch.events)?;
            let Some(applied) = self
                .apply_with_retries(destination, events, &batch.target)
                .await?
            else {
                continue;
            };

            self.store
                .commit_checkpoint(
                    &self.mirror_name,
                    CheckpointCommit {
                        expected: Some(checkpoint),
                        checkpoint: applied.clone(),
                        table_phases: batch
                            .merged
                            .iter()
                            .map(|table| (table.clone(), TableSyncPhase::Merged))
                            .collect(),
                        synced: events_count > 0,
                    },
                )
                .await?;
            checkpoint = applied;

            self.record_applied_batch(events_count, &checkpoint);

            source
                .advance_retention(&self.mirror_name, checkpoint.low_watermark())
                .await?;
            for table in &batch.merged {
                source.release_snapshot(&self.mirror_name, table).await?;
                info!(%table, position = %checkpoint.position, "table merged into the incremental stream");
            }

            if events_count > 0 {
                syncs += 1;
                if self.sync_limit > 0 && syncs >= self.sync_limit {
                    info!(syncs, "sync limit reached, pausing mirror");
                    return Ok(MirrorExit::SyncLimitReached);
                }
            }
        }
    }

    /// Returns the checkpoint with every table whose snapshot completed admitted for catch-up.
    async fn admit_snapshotted_tables(&self, checkpoint: &Checkpoint) -> MirrorResult<Checkpoint> {
        let record = self.get_checkpoint_record().await?;

        let mut working = checkpoint.clone();
        for (table, phase) in record.tables_in(TableSyncPhaseType::SnapshotDone) {
            if let Some(start) = phase.snapshot_start()
                && working.admit(table.clone(), start)
            {
                info!(%table, %start, "admitting snapshotted table for catch-up");
            }
        }

        Ok(working)
    }

    /// Reads events until the batch is full or the idle timeout elapsed.
    ///
    /// Returns `None` when a directive arrived before the batch was complete.
    async fn collect_batch(
        &mut self,
        source: &ConnectorHandle<S>,
        working: &Checkpoint,
    ) -> MirrorResult<Option<CollectedBatch>> {
        let batch_size = self.config.batch_size as usize;
        let deadline = Instant::now() + self.config.idle_timeout();

        let mut batch = CollectedBatch {
            events: Vec::new(),
            target: working.clone(),
            merged: Vec::new(),
        };

        loop {
            let read = source
                .read_changes(
                    &self.mirror_name,
                    &batch.target.read_cursors(),
                    batch_size.saturating_sub(batch.events.len()),
                )
                .await?;

            let advance = batch.target.advance(read.through);
            batch.target = advance.checkpoint;
            batch.merged.extend(advance.merged);
            batch.events.extend(read.events);

            let now = Instant::now();
            if batch.events.len() >= batch_size || now >= deadline {
                break;
            }

            let wait = (deadline - now).min(self.control_config.poll_interval());
            match self.wait(wait).await {
                Wake::Directive if self.requested_exit().is_some() => {
                    debug!(
                        events = batch.events.len(),
                        "discarding collected events on request"
                    );
                    return Ok(None);
                }
                // Apply what was collected so the next batch admits the snapshotted table.
                Wake::Snapshot => break,
                Wake::Directive | Wake::Timeout => {}
            }
        }

        Ok(Some(batch))
    }

    fn map_events(&self, events: Vec<ChangeEvent>) -> MirrorResult<Vec<DestinationEvent>> {
        events
            .into_iter()
            .map(|event| {
                let Some(mapping) = self.config.mapping_for(event.table.as_str()) else {
                    bail!(
                        ErrorKind::InvalidState,
                        "Table is not mapped to a destination table",
                        format!("Received changes for table {} which the mirror does not map", event.table)
                    );
                };

                Ok(DestinationEvent {
                    position: event.position,
                    table: mapping.destination_table.clone(),
                    change: event.change,
                })
            })
            .collect()
    }

    /// Applies `events` together with `target`, retrying retry-safe failures.
    ///
    /// Returns `None` when a directive arrived while waiting to retry, in which case nothing was
    /// applied.
    async fn apply_with_retries(
        &mut self,
        destination: &ConnectorHandle<D>,
        events: Vec<DestinationEvent>,
        target: &Checkpoint,
    ) -> MirrorResult<Option<Checkpoint>> {
        let max_attempts = self.control_config.max_apply_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match apply_batch(destination, &self.mirror_name, events.clone(), target).await
            {
                Ok(applied) => return Ok(Some(applied)),
                Err(err) => err,
            };

            counter!(
                MIRROR_APPLY_FAILURES_TOTAL,
                MIRROR_NAME_LABEL => self.mirror_name.clone(),
                ERROR_KIND_LABEL => format!("{:?}", err.kind())
            )
            .increment(1);

            if !err.is_retryable() {
                return Err(err);
            }

            if attempt >= max_attempts {
                return Err(mirror_error!(
                    ErrorKind::ApplyFailed,
                    "Batch could not be applied to the destination",
                    format!(
                        "Applying a batch of {} events failed {attempt} times, last error: {err}",
                        events.len()
                    ),
                    source: err
                ));
            }

            warn!(
                attempt,
                max_attempts,
                error = %err,
                "applying batch failed, retrying from the same checkpoint"
            );

            if self.wait(self.control_config.apply_retry_delay()).await == Wake::Directive
                && self.requested_exit().is_some()
            {
                info!("discarding batch waiting for retry on request");
                return Ok(None);
            }
        }
    }

    /// Waits up to `duration` for a directive or a snapshot signal.
    async fn wait(&mut self, duration: Duration) -> Wake {
        let wake = {
            let directive = optional_future(
                (!self.directive_closed).then(|| self.directive_rx.changed()),
            );
            let snapshot = optional_future(self.snapshot_rx.as_mut().map(|rx| rx.changed()));

            tokio::select! {
                biased;

                result = directive => result.map(|_| Wake::Directive).map_err(|_| Wake::Directive),
                result = snapshot => result.map(|_| Wake::Snapshot).map_err(|_| Wake::Snapshot),
                _ = tokio::time::sleep(duration) => Ok(Wake::Timeout),
            }
        };

        match wake {
            Ok(wake) => wake,
            // The sender is gone, stop listening to the channel.
            Err(Wake::Directive) => {
                self.directive_closed = true;
                Wake::Directive
            }
            Err(wake) => {
                self.snapshot_rx = None;
                wake
            }
        }
    }

    fn requested_exit(&self) -> Option<MirrorExit> {
        if self.directive_closed {
            return Some(MirrorExit::Stopped);
        }

        match *self.directive_rx.borrow() {
            LoopDirective::Run => None,
            LoopDirective::Pause => Some(MirrorExit::Paused),
            LoopDirective::Stop => Some(MirrorExit::Stopped),
        }
    }

    fn record_applied_batch(&self, events_count: usize, checkpoint: &Checkpoint) {
        debug!(
            events = events_count,
            position = %checkpoint.position,
            "batch applied and checkpoint committed"
        );

        counter!(
            MIRROR_BATCHES_APPLIED_TOTAL,
            MIRROR_NAME_LABEL => self.mirror_name.clone()
        )
        .increment(1);
        counter!(
            MIRROR_EVENTS_APPLIED_TOTAL,
            MIRROR_NAME_LABEL => self.mirror_name.clone()
        )
        .increment(events_count as u64);
        gauge!(
            MIRROR_CHECKPOINT_POSITION,
            MIRROR_NAME_LABEL => self.mirror_name.clone()
        )
        .set(checkpoint.position.value() as f64);
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
            })
    }

    /// Persists the state the mirror is left in by the outcome of the loop.
    async fn settle(&self, result: &MirrorResult<MirrorExit>) {
        let states: &[MirrorState] = match result {
            Ok(MirrorExit::Paused) => &[MirrorState::Paused],
            Ok(MirrorExit::SyncLimitReached) => &[MirrorState::Pausing, MirrorState::Paused],
            Ok(MirrorExit::Stopped) => &[],
            Err(err) => {
                error!(error = %err, "mirror worker failed");
                &[MirrorState::Error]
            }
        };

        for state in states {
            if let Err(err) = update_mirror_state(&self.store, &self.mirror_name, *state).await {
                warn!(
                    mirror_name = %self.mirror_name,
                    %state,
                    error = %err,
                    "could not persist the final state of the mirror worker"
                );
                break;
            }
        }
    }
}

/// Applies one batch, surrounded by the batch failpoints when they are enabled.
async fn apply_batch<D>(
    destination: &ConnectorHandle<D>,
    mirror_name: &str,
    events: Vec<DestinationEvent>,
    target: &Checkpoint,
) -> MirrorResult<Checkpoint>
where
    D: Destination,
{
    #[cfg(feature = "failpoints")]
    mirror_fail_point(APPLY_BATCH__BEFORE_APPLY)?;

    let applied = destination.apply_batch(mirror_name, events, target).await?;

    #[cfg(feature = "failpoints")]
    mirror_fail_point(APPLY_BATCH__AFTER_APPLY)?;

    Ok(applied)
}

/// Returns the tables merged in `applied` that are not merged in `record` yet.
fn newly_merged_tables(record: &CheckpointRecord, applied: &Checkpoint) -> Vec<TableName> {
    applied
        .tables
        .iter()
        .filter(|(table, cursor)| {
            **cursor == TableCursor::Merged
                && record.tables.get(*table).map(TableSyncPhase::as_type)
                    != Some(TableSyncPhaseType::Merged)
        })
        .map(|(table, _)| table.clone())
        .collect()
}
