use metrics::counter;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::concurrency::control::{DirectiveTx, LoopDirective, create_directive_channel};
use crate::connector::{ConnectorHandle, Destination, Source};
use crate::control::peers::PeerRegistry;
use crate::control::request::{CreateMirrorRequest, MirrorStatusResponse, StateChangeRequest};
use crate::coordinator::{ConfigUpdate, stage_config_update};
use crate::error::{ErrorKind, MirrorError, MirrorResult};
use crate::metrics::{
    ERROR_KIND_LABEL, MIRROR_NAME_LABEL, MIRROR_RELEASE_FAILURES_TOTAL, PEER_LABEL,
};
use crate::state::checkpoint::CheckpointRecord;
use crate::state::mirror::MirrorState;
use crate::state::table::TableSyncPhase;
use crate::store::catalog::{
    CatalogStore, MirrorRecord, record_state_transition, update_mirror_state,
};
use crate::store::checkpoint::CheckpointStore;
use crate::types::{ControlPlaneConfig, TableName};
use crate::workers::mirror::{MirrorExit, MirrorWorker, MirrorWorkerHandle};
use crate::workers::snapshot::{SnapshotMergeWorkflow, SnapshotRegistration};
use crate::{bail, mirror_error};
use mirror_config::shared::ValidationError;

/// Runtime resources of one mirror, owned by the controller.
///
/// The slot lock serializes every request for the mirror.
struct MirrorSlot<S, D, St> {
    source: Arc<S>,
    destination: Arc<D>,
    worker: Option<MirrorWorkerHandle>,
    directive_tx: Option<DirectiveTx>,
    snapshots: SnapshotMergeWorkflow<S, D, St>,
}

impl<S, D, St> MirrorSlot<S, D, St> {
    /// Collects the running loop if it ended on its own.
    async fn reap(&mut self, mirror_name: &str) {
        if let Some(worker) = self.worker.take_if(|worker| worker.is_finished()) {
            self.directive_tx = None;
            log_loop_exit(mirror_name, worker.wait().await);
        }
    }

    /// Sends `directive` to the running loop and waits for it to end.
    ///
    /// Returns `None` when no loop was running.
    async fn stop_worker(&mut self, directive: LoopDirective) -> Option<MirrorResult<MirrorExit>> {
        let worker = self.worker.take()?;

        if let Some(directive_tx) = self.directive_tx.take() {
            match directive {
                LoopDirective::Pause => directive_tx.pause(),
                LoopDirective::Stop => directive_tx.stop(),
                LoopDirective::Run => {}
            }
        }

        Some(worker.wait().await)
    }
}

fn log_loop_exit(mirror_name: &str, result: MirrorResult<MirrorExit>) {
    match result {
        Ok(exit) => info!(mirror_name, ?exit, "mirror loop ended"),
        Err(err) => warn!(mirror_name, error = %err, "mirror loop ended with an error"),
    }
}

fn report_partial_failure(mirror_name: &str, registration: &SnapshotRegistration) {
    if let Some(err) = registration.partial_failure() {
        warn!(
            mirror_name,
            error = %err,
            "some tables could not be registered for snapshot, they are excluded until retried"
        );
    }
}

fn report_release_failure(mirror_name: &str, peer: &'static str, err: &MirrorError) {
    warn!(
        mirror_name,
        peer,
        error = %err,
        "resources of the dropped mirror could not be released and are left on the peer"
    );

    counter!(
        MIRROR_RELEASE_FAILURES_TOTAL,
        MIRROR_NAME_LABEL => mirror_name.to_string(),
        PEER_LABEL => peer,
        ERROR_KIND_LABEL => format!("{:?}", err.kind())
    )
    .increment(1);
}

fn mirror_not_found(name: &str) -> MirrorError {
    mirror_error!(
        ErrorKind::MirrorNotFound,
        "Mirror not found",
        format!("No mirror named {name} exists")
    )
    .with_mirror(name)
}

/// Single entry point for mirror lifecycle and configuration requests.
///
/// The controller validates a request against the current state of the mirror before anything is
/// written, persists state and configuration together through the catalog, and drives the running
/// loop and the snapshot workflow of the mirror. Requests for the same mirror are serialized,
/// requests for different mirrors run concurrently.
pub struct MirrorController<S, D, St> {
    control_config: Arc<ControlPlaneConfig>,
    peers: PeerRegistry<S, D>,
    store: St,
    slots: Mutex<HashMap<String, Arc<Mutex<MirrorSlot<S, D, St>>>>>,
}

impl<S, D, St> MirrorController<S, D, St>
where
    S: Source + Send + Sync + 'static,
    D: Destination + Send + Sync + 'static,
    St: CatalogStore + CheckpointStore + Clone + Send + Sync + 'static,
{
    pub fn new(
        control_config: ControlPlaneConfig,
        peers: PeerRegistry<S, D>,
        store: St,
    ) -> MirrorResult<Self> {
        control_config.validate()?;

        Ok(Self {
            control_config: Arc::new(control_config),
            peers,
            store,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn peers(&self) -> &PeerRegistry<S, D> {
        &self.peers
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Creates a mirror and starts it.
    ///
    /// The mirror is persisted in [`MirrorState::Setup`]. Its tables either join the incremental
    /// stream at the current source position or, with `do_initial_snapshot`, are onboarded through
    /// the snapshot workflow. When the connectors cannot be opened, the mirror is left in
    /// [`MirrorState::Error`] and the connection error is returned.
    pub async fn create_mirror(
        &self,
        request: CreateMirrorRequest,
    ) -> MirrorResult<MirrorStatusResponse> {
        let name = request.name.clone();
        info!(mirror_name = %name, do_initial_snapshot = request.do_initial_snapshot, "creating mirror");

        if name.trim().is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "name".to_string(),
                constraint: "must not be empty".to_string(),
            }
            .into());
        }
        request.config.validate()?;
        self.peers.source(&request.source_peer).await?;
        self.peers.destination(&request.destination_peer).await?;

        let initial_phase = if request.do_initial_snapshot {
            TableSyncPhase::Pending
        } else {
            TableSyncPhase::Merged
        };
        let checkpoint_record = CheckpointRecord {
            checkpoint: None,
            tables: request
                .config
                .table_mappings
                .iter()
                .map(|mapping| (mapping.source_table.clone(), initial_phase.clone()))
                .collect(),
            syncs_completed: 0,
        };

        self.store
            .insert_mirror(MirrorRecord {
                name: name.clone(),
                source_peer: request.source_peer,
                destination_peer: request.destination_peer,
                status: MirrorState::Setup,
                config: request.config,
                staged_config: None,
                sync_limit: 0,
            })
            .await?;
        self.store
            .insert_checkpoint_record(&name, checkpoint_record)
            .await?;

        let (mut slot, record) = self.lock_mirror(&name).await?;

        let mut registration = SnapshotRegistration::default();
        if request.do_initial_snapshot {
            let tables = record
                .config
                .table_mappings
                .iter()
                .map(|mapping| mapping.source_table.clone())
                .collect();
            registration = slot.snapshots.start(&record.config, tables).await;
            report_partial_failure(&name, &registration);
        }

        self.start_worker(&mut slot, &record).await?;

        Ok(self
            .mirror_status(&name)
            .await?
            .with_registration(&registration))
    }

    /// Moves a mirror to the requested state, applying its configuration update if any.
    ///
    /// A request that is not legal in the current state fails with
    /// [`ErrorKind::IllegalTransition`], an invalid configuration update with
    /// [`ErrorKind::ValidationError`]. Neither changes the mirror.
    pub async fn change_state(
        &self,
        request: StateChangeRequest,
    ) -> MirrorResult<MirrorStatusResponse> {
        let name = request.mirror_name.clone();
        let (mut slot, record) = self.lock_mirror(&name).await?;

        info!(
            mirror_name = %name,
            current_state = %record.status,
            requested_state = %request.requested_state,
            has_config_update = request.config_update.is_some(),
            drop_stats = request.drop_stats,
            "mirror state change requested"
        );

        let result = match (&request.config_update, request.requested_state) {
            (_, MirrorState::Dropped | MirrorState::Dropping) => {
                self.drop_mirror(&mut slot, record, request.drop_stats).await
            }
            (Some(update), requested_state) => {
                self.edit_mirror(&mut slot, record, update, requested_state)
                    .await
            }
            (None, MirrorState::Paused) => self.pause_mirror(&mut slot, record).await,
            (None, MirrorState::Running) => self.resume_mirror(&mut slot, record).await,
            (None, requested_state) => Err(mirror_error!(
                ErrorKind::IllegalTransition,
                "Requested state cannot be requested",
                format!("A mirror can be requested to be RUNNING, PAUSED or DROPPED, not {requested_state}")
            )),
        };

        result.map_err(|err| err.with_mirror(&name))
    }

    /// Returns the status of mirror `name`.
    pub async fn mirror_status(&self, name: &str) -> MirrorResult<MirrorStatusResponse> {
        let record = self.get_record(name).await?;
        let checkpoint = self.store.get_checkpoint_record(name).await?;

        Ok(MirrorStatusResponse::new(
            &record,
            checkpoint.as_ref(),
            D::kind(),
        ))
    }

    /// Returns the status of every mirror, ordered by name.
    pub async fn list_mirrors(&self) -> MirrorResult<Vec<MirrorStatusResponse>> {
        let mut statuses = Vec::new();
        for record in self.store.get_mirrors().await? {
            let checkpoint = self.store.get_checkpoint_record(&record.name).await?;
            statuses.push(MirrorStatusResponse::new(
                &record,
                checkpoint.as_ref(),
                D::kind(),
            ));
        }

        Ok(statuses)
    }

    /// Re-runs the failed snapshot of `table`.
    ///
    /// Returns once the table is registered again, the copy continues in the background.
    pub async fn retry_snapshot(
        &self,
        name: &str,
        table: &str,
    ) -> MirrorResult<MirrorStatusResponse> {
        let table = TableName::parse(table)?;
        let (slot, record) = self.lock_mirror(name).await?;

        if matches!(record.status, MirrorState::Dropping | MirrorState::Dropped) {
            bail!(
                ErrorKind::IllegalTransition,
                "Snapshots of a dropped mirror cannot be retried",
                format!("Mirror {name} is {}", record.status)
            );
        }

        let registration = slot
            .snapshots
            .retry(record.effective_config(), &table)
            .await
            .map_err(|err| err.with_mirror(name))?;
        if let Some(err) = registration.partial_failure() {
            return Err(err.with_mirror(name));
        }
        drop(slot);

        self.mirror_status(name).await
    }

    /// Re-attaches every persisted mirror after a restart of the control plane.
    ///
    /// Mirrors that were running get their loop restarted, mirrors interrupted while pausing or
    /// editing settle to [`MirrorState::Paused`] and interrupted drops are completed keeping their
    /// statistics. Unfinished snapshots resume with the first table that did not complete.
    pub async fn recover(&self) -> MirrorResult<()> {
        let mut errors = Vec::new();

        for record in self.store.get_mirrors().await? {
            let name = record.name.clone();
            info!(mirror_name = %name, state = %record.status, "recovering mirror");

            if let Err(err) = self.recover_mirror(&name).await {
                error!(mirror_name = %name, error = %err, "mirror could not be recovered");
                errors.push(err.with_mirror(&name));
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(())
    }

    /// Stops the running loops and snapshot copies of every mirror without changing their state.
    ///
    /// [`MirrorController::recover`] picks the mirrors up again.
    pub async fn shutdown(&self) {
        let slots = self
            .slots
            .lock()
            .await
            .drain()
            .collect::<Vec<_>>();

        for (name, slot) in slots {
            let mut slot = slot.lock().await;

            if let Some(result) = slot.stop_worker(LoopDirective::Stop).await {
                log_loop_exit(&name, result);
            }
            if let Err(err) = slot.snapshots.shutdown().await {
                warn!(mirror_name = %name, error = %err, "snapshot workers ended with errors");
            }
        }

        info!("mirror controller shut down");
    }

    async fn recover_mirror(&self, name: &str) -> MirrorResult<()> {
        let (mut slot, record) = self.lock_mirror(name).await?;

        match record.status {
            MirrorState::Setup | MirrorState::Running | MirrorState::Resuming => {
                if slot.worker.is_none() {
                    self.start_worker(&mut slot, &record).await?;
                }
            }
            MirrorState::Pausing | MirrorState::Editing => {
                update_mirror_state(&self.store, name, MirrorState::Paused).await?;
            }
            MirrorState::Dropping => {
                self.drop_mirror(&mut slot, record, false).await?;
                return Ok(());
            }
            MirrorState::Dropped => {
                self.store.delete_mirror(name).await?;
                drop(slot);
                self.slots.lock().await.remove(name);
                return Ok(());
            }
            MirrorState::Paused | MirrorState::Error => {}
        }

        let registration = slot.snapshots.resume(record.effective_config()).await?;
        report_partial_failure(name, &registration);

        Ok(())
    }

    async fn pause_mirror(
        &self,
        slot: &mut MirrorSlot<S, D, St>,
        record: MirrorRecord,
    ) -> MirrorResult<MirrorStatusResponse> {
        if record.status == MirrorState::Paused {
            return self.mirror_status(&record.name).await;
        }

        update_mirror_state(&self.store, &record.name, MirrorState::Pausing).await?;

        if let Some(result) = slot.stop_worker(LoopDirective::Pause).await {
            // A failed loop already moved the mirror to ERROR.
            result?;
        }

        // Without a loop nobody else settles the pause.
        let record = self.get_record(&record.name).await?;
        if record.status == MirrorState::Pausing {
            update_mirror_state(&self.store, &record.name, MirrorState::Paused).await?;
        }

        self.mirror_status(&record.name).await
    }

    async fn resume_mirror(
        &self,
        slot: &mut MirrorSlot<S, D, St>,
        record: MirrorRecord,
    ) -> MirrorResult<MirrorStatusResponse> {
        match record.status {
            MirrorState::Running | MirrorState::Resuming | MirrorState::Setup => {
                if slot.worker.is_none() {
                    self.start_worker(slot, &record).await?;
                }
            }
            _ => {
                let mut resumed = record.clone();
                resumed.status = MirrorState::Resuming;
                // The staged configuration is swapped in together with the state, the next run
                // only ever sees the complete new configuration.
                if let Some(staged_config) = resumed.staged_config.take() {
                    resumed.config = staged_config;
                    info!(
                        mirror_name = %record.name,
                        batch_size = resumed.config.batch_size,
                        idle_timeout_seconds = resumed.config.idle_timeout_seconds,
                        tables = resumed.config.table_mappings.len(),
                        "applying staged configuration"
                    );
                }
                self.write_record(record.status, resumed.clone()).await?;

                self.start_worker(slot, &resumed).await?;
            }
        }

        let record = self.get_record(&record.name).await?;
        let registration = slot.snapshots.resume(&record.config).await?;
        report_partial_failure(&record.name, &registration);

        Ok(self
            .mirror_status(&record.name)
            .await?
            .with_registration(&registration))
    }

    async fn edit_mirror(
        &self,
        slot: &mut MirrorSlot<S, D, St>,
        record: MirrorRecord,
        update: &ConfigUpdate,
        requested_state: MirrorState,
    ) -> MirrorResult<MirrorStatusResponse> {
        if !matches!(requested_state, MirrorState::Running | MirrorState::Paused) {
            bail!(
                ErrorKind::IllegalTransition,
                "Edited mirror can only be left paused or running",
                format!("An edited mirror cannot be requested to be {requested_state}")
            );
        }

        if !record.status.accepts_config_update() {
            bail!(
                ErrorKind::IllegalTransition,
                "Configuration can only be updated while the mirror is PAUSED",
                format!(
                    "The configuration of mirror {} cannot be updated while it is {}, pause it first",
                    record.name, record.status
                )
            );
        }

        let staged = stage_config_update(record.effective_config(), update)?;

        let mut editing = record.clone();
        editing.status = MirrorState::Editing;
        editing.staged_config = Some(staged.config.clone());
        if let Some(sync_limit) = staged.sync_limit {
            editing.sync_limit = sync_limit;
        }
        self.write_record(record.status, editing.clone()).await?;

        let mut registration = SnapshotRegistration::default();
        let tables = staged.delta.tables().cloned().collect::<Vec<_>>();
        if !tables.is_empty() {
            let pending = tables
                .iter()
                .map(|table| (table.clone(), TableSyncPhase::Pending))
                .collect();
            if let Err(err) = self.store.update_table_phases(&record.name, pending).await {
                // Nothing was registered yet, restore the mirror as it was.
                if let Err(rollback_err) = self.write_record(editing.status, record).await {
                    error!(error = %rollback_err, "edit could not be rolled back");
                }

                return Err(err);
            }

            info!(
                mirror_name = %editing.name,
                tables = ?tables,
                "registering added tables for snapshot"
            );
            registration = slot.snapshots.start(&staged.config, tables).await;
            report_partial_failure(&editing.name, &registration);
        }

        let status = match requested_state {
            MirrorState::Running => self.resume_mirror(slot, editing).await?,
            _ => {
                update_mirror_state(&self.store, &editing.name, MirrorState::Paused).await?;
                self.mirror_status(&editing.name).await?
            }
        };

        Ok(status.with_registration(&registration))
    }

    async fn drop_mirror(
        &self,
        slot: &mut MirrorSlot<S, D, St>,
        record: MirrorRecord,
        drop_stats: bool,
    ) -> MirrorResult<MirrorStatusResponse> {
        let name = record.name.clone();
        update_mirror_state(&self.store, &name, MirrorState::Dropping).await?;

        if let Some(result) = slot.stop_worker(LoopDirective::Stop).await {
            log_loop_exit(&name, result);
        }
        if let Err(err) = slot.snapshots.shutdown().await {
            warn!(mirror_name = %name, error = %err, "snapshot workers ended with errors");
        }

        self.release_resources(slot, &name).await;

        if drop_stats {
            self.store.delete_checkpoint_record(&name).await?;
        }
        let checkpoint = self.store.get_checkpoint_record(&name).await?;

        update_mirror_state(&self.store, &name, MirrorState::Dropped).await?;
        let dropped = MirrorRecord {
            status: MirrorState::Dropped,
            ..record
        };
        self.store.delete_mirror(&name).await?;
        self.slots.lock().await.remove(&name);

        info!(mirror_name = %name, drop_stats, "mirror dropped");

        Ok(MirrorStatusResponse::new(
            &dropped,
            checkpoint.as_ref(),
            D::kind(),
        ))
    }

    /// Drops the change retention of the mirror on the source and its checkpoint on the
    /// destination.
    ///
    /// A peer that cannot be reached keeps its resources, the failure is logged and counted.
    async fn release_resources(&self, slot: &MirrorSlot<S, D, St>, name: &str) {
        let mut source = ConnectorHandle::source(slot.source.clone());
        let dropped = async {
            source.open().await?;
            source.drop_retention(name).await
        }
        .await;
        source.close().await;
        if let Err(err) = dropped {
            report_release_failure(name, "source", &err);
        }

        let mut destination = ConnectorHandle::destination(slot.destination.clone());
        let dropped = async {
            destination.open().await?;
            destination.drop_checkpoint(name).await
        }
        .await;
        destination.close().await;
        if let Err(err) = dropped {
            report_release_failure(name, "destination", &err);
        }
    }

    async fn start_worker(
        &self,
        slot: &mut MirrorSlot<S, D, St>,
        record: &MirrorRecord,
    ) -> MirrorResult<()> {
        let (directive_tx, directive_rx) = create_directive_channel();

        let worker = MirrorWorker::new(
            record.name.clone(),
            Arc::new(record.config.clone()),
            self.control_config.clone(),
            record.sync_limit,
            slot.source.clone(),
            slot.destination.clone(),
            self.store.clone(),
            directive_rx,
            Some(slot.snapshots.subscribe()),
        );
        let handle = worker.start().await?;

        slot.worker = Some(handle);
        slot.directive_tx = Some(directive_tx);

        Ok(())
    }

    /// Persists `record`, whose state and configuration change together.
    async fn write_record(&self, previous: MirrorState, record: MirrorRecord) -> MirrorResult<()> {
        let name = record.name.clone();
        let status = record.status;

        if previous != status {
            previous
                .check_transition(status)
                .map_err(|err| err.with_mirror(&name))?;
        }

        self.store.update_mirror(record).await?;
        if previous != status {
            record_state_transition(&name, previous, status);
        }

        Ok(())
    }

    async fn get_record(&self, name: &str) -> MirrorResult<MirrorRecord> {
        self.store
            .get_mirror(name)
            .await?
            .ok_or_else(|| mirror_not_found(name))
    }

    /// Locks the slot of mirror `name` and returns it with the current record of the mirror.
    async fn lock_mirror(
        &self,
        name: &str,
    ) -> MirrorResult<(OwnedMutexGuard<MirrorSlot<S, D, St>>, MirrorRecord)> {
        let record = self.get_record(name).await?;
        let slot = self.slot(&record).await?;

        let mut slot = slot.lock_owned().await;
        slot.reap(name).await;

        // The record may have changed while waiting for the slot.
        let record = self.get_record(name).await?;

        Ok((slot, record))
    }

    async fn slot(&self, record: &MirrorRecord) -> MirrorResult<Arc<Mutex<MirrorSlot<S, D, St>>>> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(&record.name) {
            return Ok(slot.clone());
        }

        let source = self.peers.source(&record.source_peer).await?;
        let destination = self.peers.destination(&record.destination_peer).await?;
        let snapshots = SnapshotMergeWorkflow::new(
            record.name.clone(),
            self.control_config.clone(),
            source.clone(),
            destination.clone(),
            self.store.clone(),
        );

        let slot = Arc::new(Mutex::new(MirrorSlot {
            source,
            destination,
            worker: None,
            directive_tx: None,
            snapshots,
        }));
        slots.insert(record.name.clone(), slot.clone());

        Ok(slot)
    }
}
