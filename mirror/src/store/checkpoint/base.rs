use std::future::Future;

use crate::error::MirrorResult;
use crate::state::checkpoint::{Checkpoint, CheckpointRecord};
use crate::state::table::TableSyncPhase;
use crate::types::TableName;

/// A checkpoint advance committed by the running loop after a successfully applied batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointCommit {
    /// Checkpoint the batch was read from, compared against the stored one.
    pub expected: Option<Checkpoint>,
    pub checkpoint: Checkpoint,
    /// Phases of tables that changed with this advance, such as tables that merged.
    pub table_phases: Vec<(TableName, TableSyncPhase)>,
    /// Whether the batch carried events and counts as a sync.
    pub synced: bool,
}

/// Trait for storing and retrieving the checkpoint record of each mirror.
///
/// The checkpoint of a mirror is only written by its running loop through
/// [`CheckpointStore::commit_checkpoint`]. Table phases are also written by the snapshot workers
/// and the control API when tables are added.
pub trait CheckpointStore {
    /// Returns the checkpoint record of mirror `mirror_name`.
    fn get_checkpoint_record(
        &self,
        mirror_name: &str,
    ) -> impl Future<Output = MirrorResult<Option<CheckpointRecord>>> + Send;

    /// Stores the initial checkpoint record of a new mirror.
    fn insert_checkpoint_record(
        &self,
        mirror_name: &str,
        record: CheckpointRecord,
    ) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Atomically replaces the checkpoint if the stored one equals `commit.expected`.
    ///
    /// Fails with [`crate::error::ErrorKind::CheckpointConflict`] and changes nothing otherwise.
    fn commit_checkpoint(
        &self,
        mirror_name: &str,
        commit: CheckpointCommit,
    ) -> impl Future<Output = MirrorResult<CheckpointRecord>> + Send;

    /// Updates multiple table phases atomically.
    fn update_table_phases(
        &self,
        mirror_name: &str,
        updates: Vec<(TableName, TableSyncPhase)>,
    ) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Updates the phase of `table`.
    fn update_table_phase(
        &self,
        mirror_name: &str,
        table: TableName,
        phase: TableSyncPhase,
    ) -> impl Future<Output = MirrorResult<()>> + Send {
        self.update_table_phases(mirror_name, vec![(table, phase)])
    }

    /// Deletes the checkpoint record of mirror `mirror_name`.
    fn delete_checkpoint_record(
        &self,
        mirror_name: &str,
    ) -> impl Future<Output = MirrorResult<()>> + Send;
}
