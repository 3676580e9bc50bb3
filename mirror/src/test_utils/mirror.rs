use mirror_config::shared::TableMapping;

use crate::connector::memory::{MemoryDestination, MemorySource};
use crate::control::{CreateMirrorRequest, MirrorController, MirrorStatusResponse, PeerRegistry};
use crate::error::MirrorResult;
use crate::state::mirror::MirrorState;
use crate::state::table::TableSyncPhaseType;
use crate::test_utils::faulty::{FaultyDestination, FaultySource};
use crate::test_utils::notifying_store::NotifyingStore;
use crate::types::{ControlPlaneConfig, MirrorConfig, TableName};

pub const SOURCE_PEER: &str = "source";
pub const DESTINATION_PEER: &str = "destination";

pub type TestController = MirrorController<FaultySource, FaultyDestination, NotifyingStore>;

/// Returns a control plane configuration with short intervals so tests settle quickly.
pub fn test_control_plane_config() -> ControlPlaneConfig {
    ControlPlaneConfig {
        max_apply_attempts: 3,
        apply_retry_delay_ms: 10,
        max_snapshot_workers: 2,
        snapshot_batch_size: 2,
        poll_interval_ms: 5,
    }
}

pub fn table_name(name: &str) -> TableName {
    TableName::parse(name).expect("test table names are schema-qualified")
}

/// Builds a mirror configuration mapping each `(source, destination)` pair.
///
/// The idle timeout is zero so every poll applies what it read.
pub fn mirror_config(tables: &[(&str, &str)]) -> MirrorConfig {
    let mappings = tables
        .iter()
        .map(|(source, destination)| {
            TableMapping::parse(*source, *destination).expect("test table names are schema-qualified")
        })
        .collect();

    MirrorConfig {
        batch_size: 100,
        idle_timeout_seconds: 0,
        table_mappings: mappings,
    }
}

/// A controller wired to one faulty memory source, one faulty memory destination and a notifying
/// store.
pub struct TestMirrorEnv {
    pub source: FaultySource,
    pub destination: FaultyDestination,
    pub store: NotifyingStore,
    pub controller: TestController,
}

impl TestMirrorEnv {
    pub async fn new() -> Self {
        Self::with_config(test_control_plane_config()).await
    }

    pub async fn with_config(control_config: ControlPlaneConfig) -> Self {
        let source = FaultySource::wrap(MemorySource::new());
        let destination = FaultyDestination::wrap(MemoryDestination::new());
        let store = NotifyingStore::new();

        let peers = PeerRegistry::new();
        peers
            .create_source_peer(SOURCE_PEER, source.clone(), false)
            .await
            .expect("source peer is registered once");
        peers
            .create_destination_peer(DESTINATION_PEER, destination.clone(), false)
            .await
            .expect("destination peer is registered once");

        let controller = MirrorController::new(control_config, peers, store.clone())
            .expect("test control plane configuration is valid");

        Self {
            source,
            destination,
            store,
            controller,
        }
    }

    /// Returns a controller for the same peers and store, as after a restart of the control plane.
    pub fn restarted_controller(&self) -> TestController {
        MirrorController::new(
            test_control_plane_config(),
            self.controller.peers().clone(),
            self.store.clone(),
        )
        .expect("test control plane configuration is valid")
    }

    pub async fn create_mirror(
        &self,
        name: &str,
        config: MirrorConfig,
        do_initial_snapshot: bool,
    ) -> MirrorResult<MirrorStatusResponse> {
        self.controller
            .create_mirror(CreateMirrorRequest {
                name: name.to_string(),
                source_peer: SOURCE_PEER.to_string(),
                destination_peer: DESTINATION_PEER.to_string(),
                config,
                do_initial_snapshot,
            })
            .await
    }

    pub async fn wait_for_state(&self, name: &str, state: MirrorState) {
        self.store
            .notify_on_mirror_state(name, state)
            .await
            .notified()
            .await;
    }

    pub async fn wait_for_phase(&self, name: &str, table: &TableName, phase: TableSyncPhaseType) {
        self.store
            .notify_on_table_phase(name, table, phase)
            .await
            .notified()
            .await;
    }

    /// Waits until mirror `name` applied at least `syncs` non-empty batches.
    pub async fn wait_for_syncs(&self, name: &str, syncs: u64) {
        self.store
            .notify_on_syncs(name, syncs)
            .await
            .notified()
            .await;
    }
}
