use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::coordinator::ConfigUpdate;
use crate::state::checkpoint::CheckpointRecord;
use crate::state::mirror::MirrorState;
use crate::state::table::{RetryPolicy, TableSyncPhase};
use crate::store::catalog::MirrorRecord;
use crate::types::{MirrorConfig, Position, TableName};
use crate::workers::snapshot::SnapshotRegistration;

/// Request to create a mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMirrorRequest {
    pub name: String,
    pub source_peer: String,
    pub destination_peer: String,
    pub config: MirrorConfig,
    /// Copies the current contents of every table before streaming its changes. Without it,
    /// only changes made after the mirror was created are mirrored.
    #[serde(default)]
    pub do_initial_snapshot: bool,
}

/// Request to move a mirror to another state, optionally editing its configuration.
///
/// `requested_state` is one of [`MirrorState::Running`], [`MirrorState::Paused`] or
/// [`MirrorState::Dropped`]. A configuration update is only accepted while the mirror is paused,
/// the requested state then decides whether the mirror resumes after the edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRequest {
    pub mirror_name: String,
    pub requested_state: MirrorState,
    pub config_update: Option<ConfigUpdate>,
    /// Deletes the checkpoint record and sync statistics of a dropped mirror.
    #[serde(default)]
    pub drop_stats: bool,
}

impl StateChangeRequest {
    pub fn pause(mirror_name: impl Into<String>) -> Self {
        Self::to_state(mirror_name, MirrorState::Paused)
    }

    pub fn resume(mirror_name: impl Into<String>) -> Self {
        Self::to_state(mirror_name, MirrorState::Running)
    }

    /// Edits a paused mirror and leaves it in `requested_state`.
    pub fn edit(
        mirror_name: impl Into<String>,
        config_update: ConfigUpdate,
        requested_state: MirrorState,
    ) -> Self {
        Self {
            config_update: Some(config_update),
            ..Self::to_state(mirror_name, requested_state)
        }
    }

    pub fn drop(mirror_name: impl Into<String>, drop_stats: bool) -> Self {
        Self {
            drop_stats,
            ..Self::to_state(mirror_name, MirrorState::Dropped)
        }
    }

    fn to_state(mirror_name: impl Into<String>, requested_state: MirrorState) -> Self {
        Self {
            mirror_name: mirror_name.into(),
            requested_state,
            config_update: None,
            drop_stats: false,
        }
    }
}

/// A table whose snapshot failed and waits for a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTable {
    pub table: TableName,
    pub reason: String,
    pub solution: Option<String>,
    pub retry_policy: RetryPolicy,
}

/// A table a request could not register for snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisteredTable {
    pub table: TableName,
    pub reason: String,
}

/// Progress of a mirror as recorded in its checkpoint record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    /// Last source position durably reflected in the destination.
    pub position: Option<Position>,
    /// Snapshot phase of every table of the mirror.
    pub tables: BTreeMap<TableName, TableSyncPhase>,
}

impl From<&CheckpointRecord> for CheckpointSummary {
    fn from(record: &CheckpointRecord) -> Self {
        Self {
            position: record
                .checkpoint
                .as_ref()
                .map(|checkpoint| checkpoint.position),
            tables: record.tables.clone(),
        }
    }
}

/// Status of a mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStatusResponse {
    pub mirror_name: String,
    pub current_state: MirrorState,
    /// Configuration the running loop uses.
    pub config: MirrorConfig,
    /// Configuration accepted by an edit that applies from the next resume.
    pub staged_config: Option<MirrorConfig>,
    pub source_name: String,
    pub destination_name: String,
    /// Kind of the destination connector.
    pub destination_type: String,
    pub checkpoint: CheckpointSummary,
    /// Number of non-empty batches applied over the life of the mirror.
    pub number_of_syncs: u64,
    /// Tables excluded from batches until their snapshot is retried successfully.
    pub failed_tables: Vec<FailedTable>,
    /// Tables the request could not register for snapshot. The request took effect anyway,
    /// these tables are a partial snapshot failure and wait for a retry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unregistered_tables: Vec<UnregisteredTable>,
}

impl MirrorStatusResponse {
    pub(crate) fn new(
        record: &MirrorRecord,
        checkpoint: Option<&CheckpointRecord>,
        destination_type: &str,
    ) -> Self {
        let failed_tables = checkpoint
            .into_iter()
            .flat_map(|checkpoint| checkpoint.tables.iter())
            .filter_map(|(table, phase)| match phase {
                TableSyncPhase::Errored {
                    reason,
                    solution,
                    retry_policy,
                } => Some(FailedTable {
                    table: table.clone(),
                    reason: reason.clone(),
                    solution: solution.clone(),
                    retry_policy: retry_policy.clone(),
                }),
                _ => None,
            })
            .collect();

        Self {
            mirror_name: record.name.clone(),
            current_state: record.status,
            config: record.config.clone(),
            staged_config: record.staged_config.clone(),
            source_name: record.source_peer.clone(),
            destination_name: record.destination_peer.clone(),
            destination_type: destination_type.to_string(),
            checkpoint: checkpoint.map(CheckpointSummary::from).unwrap_or_default(),
            number_of_syncs: checkpoint.map_or(0, |checkpoint| checkpoint.syncs_completed),
            failed_tables,
            unregistered_tables: vec![],
        }
    }

    /// Adds the tables `registration` failed to register to the response.
    pub(crate) fn with_registration(mut self, registration: &SnapshotRegistration) -> Self {
        self.unregistered_tables
            .extend(registration.failed.iter().map(|(table, err)| UnregisteredTable {
                table: table.clone(),
                reason: err.to_string(),
            }));

        self
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_change_request_deserializes_with_defaults() {
        let request: StateChangeRequest = serde_json::from_str(
            r#"{
                "mirror_name": "orders",
                "requested_state": "RUNNING",
                "config_update": { "batch_size": 500, "additional_tables": [] }
            }"#,
        )
        .unwrap();

        assert_eq!(request.requested_state, MirrorState::Running);
        assert!(!request.drop_stats);
        let update = request.config_update.unwrap();
        assert_eq!(update.batch_size, Some(500));
        assert_eq!(update.idle_timeout_seconds, None);
        assert!(update.removed_tables.is_empty());
    }
}
