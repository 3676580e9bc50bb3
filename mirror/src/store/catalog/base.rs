use metrics::counter;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::info;

use crate::error::MirrorResult;
use crate::metrics::{MIRROR_NAME_LABEL, MIRROR_STATE_TRANSITIONS_TOTAL, STATE_LABEL};
use crate::state::mirror::MirrorState;
use crate::types::MirrorConfig;

/// Everything the catalog keeps for one mirror.
///
/// State and configuration live in the same record, so they are always written together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub name: String,
    /// Name of the source peer the mirror reads from.
    pub source_peer: String,
    /// Name of the destination peer the mirror writes to.
    pub destination_peer: String,
    pub status: MirrorState,
    /// Configuration the running loop uses.
    pub config: MirrorConfig,
    /// Configuration accepted by an edit, swapped in when the mirror resumes.
    pub staged_config: Option<MirrorConfig>,
    /// Number of syncs after which the running loop pauses the mirror, `0` for no limit.
    pub sync_limit: u64,
}

impl MirrorRecord {
    /// Returns the configuration the next run of the mirror will use.
    pub fn effective_config(&self) -> &MirrorConfig {
        self.staged_config.as_ref().unwrap_or(&self.config)
    }
}

/// Trait for storing and retrieving mirror records.
///
/// Stores persist what they are given. Transitions are checked against the mirror state machine
/// by [`update_mirror_state`] before they reach the store.
pub trait CatalogStore {
    /// Returns the record of mirror `name`.
    fn get_mirror(
        &self,
        name: &str,
    ) -> impl Future<Output = MirrorResult<Option<MirrorRecord>>> + Send;

    /// Returns the records of all mirrors ordered by name.
    fn get_mirrors(&self) -> impl Future<Output = MirrorResult<Vec<MirrorRecord>>> + Send;

    /// Inserts a new mirror record.
    ///
    /// Fails with [`crate::error::ErrorKind::MirrorAlreadyExists`] if the name is taken.
    fn insert_mirror(&self, record: MirrorRecord) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Replaces the record of an existing mirror, status and configuration at once.
    fn update_mirror(&self, record: MirrorRecord) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Moves mirror `name` to `status` and returns the state it left.
    fn update_mirror_status(
        &self,
        name: &str,
        status: MirrorState,
    ) -> impl Future<Output = MirrorResult<MirrorState>> + Send;

    /// Deletes the record of mirror `name`.
    fn delete_mirror(&self, name: &str) -> impl Future<Output = MirrorResult<()>> + Send;
}

/// Moves mirror `name` to `state` through `store`, logging and counting the transition.
///
/// Fails with [`crate::error::ErrorKind::IllegalTransition`] and leaves the mirror unchanged
/// when the mirror cannot move to `state`. Returns the state the mirror left.
pub async fn update_mirror_state<St>(
    store: &St,
    name: &str,
    state: MirrorState,
) -> MirrorResult<MirrorState>
where
    St: CatalogStore,
{
    if let Some(current) = store.get_mirror(name).await?
        && current.status != state
    {
        current
            .status
            .check_transition(state)
            .map_err(|err| err.with_mirror(name))?;
    }

    let previous = store.update_mirror_status(name, state).await?;
    if previous != state {
        record_state_transition(name, previous, state);
    }

    Ok(previous)
}

/// Logs and counts a persisted transition of mirror `name`.
pub fn record_state_transition(name: &str, from: MirrorState, to: MirrorState) {
    info!(mirror_name = name, %from, %to, "mirror state changed");

    counter!(
        MIRROR_STATE_TRANSITIONS_TOTAL,
        MIRROR_NAME_LABEL => name.to_string(),
        STATE_LABEL => to.as_static_str()
    )
    .increment(1);
}
