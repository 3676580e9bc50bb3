use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::{ErrorKind, MirrorError, MirrorResult};
use crate::mirror_error;
use crate::state::checkpoint::CheckpointRecord;
use crate::state::mirror::MirrorState;
use crate::state::table::TableSyncPhase;
use crate::store::catalog::{CatalogStore, MirrorRecord};
use crate::store::checkpoint::{CheckpointCommit, CheckpointStore};
use crate::types::TableName;

/// Inner state of [`MemoryStore`]
#[derive(Debug)]
struct Inner {
    /// Mirror records keyed by mirror name.
    mirrors: BTreeMap<String, MirrorRecord>,
    /// Every state each mirror left, in order, used for debugging and auditing.
    mirror_state_history: HashMap<String, Vec<MirrorState>>,
    /// Checkpoint records keyed by mirror name.
    checkpoints: HashMap<String, CheckpointRecord>,
}

fn mirror_not_found(name: &str) -> MirrorError {
    mirror_error!(
        ErrorKind::MirrorNotFound,
        "Mirror not found",
        format!("No mirror named {name} exists")
    )
    .with_mirror(name)
}

fn checkpoint_record_not_found(name: &str) -> MirrorError {
    mirror_error!(
        ErrorKind::InvalidState,
        "Checkpoint record not found",
        format!("Mirror {name} has no checkpoint record")
    )
    .with_mirror(name)
}

/// In-memory storage for mirror records and checkpoints.
///
/// [`MemoryStore`] implements both [`CatalogStore`] and [`CheckpointStore`]. Every operation runs
/// under a single lock, which makes each of them atomic. All data is lost on process restart.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates a new empty memory store.
    pub fn new() -> Self {
        let inner = Inner {
            mirrors: BTreeMap::new(),
            mirror_state_history: HashMap::new(),
            checkpoints: HashMap::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns the states mirror `name` went through, oldest first, ending with its current one.
    pub async fn get_mirror_state_history(&self, name: &str) -> Vec<MirrorState> {
        let inner = self.inner.lock().await;

        let mut history = inner
            .mirror_state_history
            .get(name)
            .cloned()
            .unwrap_or_default();
        if let Some(record) = inner.mirrors.get(name) {
            history.push(record.status);
        }

        history
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore for MemoryStore {
    async fn get_mirror(&self, name: &str) -> MirrorResult<Option<MirrorRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.mirrors.get(name).cloned())
    }

    async fn get_mirrors(&self) -> MirrorResult<Vec<MirrorRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.mirrors.values().cloned().collect())
    }

    async fn insert_mirror(&self, record: MirrorRecord) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.mirrors.contains_key(&record.name) {
            return Err(mirror_error!(
                ErrorKind::MirrorAlreadyExists,
                "Mirror already exists",
                format!("A mirror named {} already exists", record.name)
            )
            .with_mirror(&record.name));
        }

        inner.mirror_state_history.remove(&record.name);
        inner.mirrors.insert(record.name.clone(), record);

        Ok(())
    }

    async fn update_mirror(&self, record: MirrorRecord) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(current) = inner.mirrors.get(&record.name) else {
            return Err(mirror_not_found(&record.name));
        };

        let previous = current.status;
        if previous != record.status {
            previous
                .check_transition(record.status)
                .map_err(|err| err.with_mirror(&record.name))?;

            inner
                .mirror_state_history
                .entry(record.name.clone())
                .or_default()
                .push(previous);
        }

        inner.mirrors.insert(record.name.clone(), record);

        Ok(())
    }

    async fn update_mirror_status(&self, name: &str, status: MirrorState) -> MirrorResult<MirrorState> {
        let mut inner = self.inner.lock().await;

        let Some(record) = inner.mirrors.get_mut(name) else {
            return Err(mirror_not_found(name));
        };

        let previous = record.status;
        if previous == status {
            return Ok(previous);
        }

        previous
            .check_transition(status)
            .map_err(|err| err.with_mirror(name))?;
        record.status = status;

        inner
            .mirror_state_history
            .entry(name.to_string())
            .or_default()
            .push(previous);

        Ok(previous)
    }

    async fn delete_mirror(&self, name: &str) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;

        if let Some(record) = inner.mirrors.remove(name) {
            inner
                .mirror_state_history
                .entry(name.to_string())
                .or_default()
                .push(record.status);
        }

        Ok(())
    }
}

impl CheckpointStore for MemoryStore {
    async fn get_checkpoint_record(&self, mirror_name: &str) -> MirrorResult<Option<CheckpointRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.checkpoints.get(mirror_name).cloned())
    }

    async fn insert_checkpoint_record(
        &self,
        mirror_name: &str,
        record: CheckpointRecord,
    ) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.insert(mirror_name.to_string(), record);

        Ok(())
    }

    async fn commit_checkpoint(
        &self,
        mirror_name: &str,
        commit: CheckpointCommit,
    ) -> MirrorResult<CheckpointRecord> {
        let mut inner = self.inner.lock().await;

        let Some(record) = inner.checkpoints.get_mut(mirror_name) else {
            return Err(checkpoint_record_not_found(mirror_name));
        };

        if record.checkpoint != commit.expected {
            return Err(mirror_error!(
                ErrorKind::CheckpointConflict,
                "Checkpoint changed concurrently",
                format!(
                    "Expected the checkpoint of mirror {mirror_name} at {:?} but found {:?}",
                    commit.expected.as_ref().map(|c| c.position),
                    record.checkpoint.as_ref().map(|c| c.position)
                )
            )
            .with_mirror(mirror_name));
        }

        record.checkpoint = Some(commit.checkpoint);
        for (table, phase) in commit.table_phases {
            record.tables.insert(table, phase);
        }
        if commit.synced {
            record.syncs_completed += 1;
        }

        Ok(record.clone())
    }

    async fn update_table_phases(
        &self,
        mirror_name: &str,
        updates: Vec<(TableName, TableSyncPhase)>,
    ) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(record) = inner.checkpoints.get_mut(mirror_name) else {
            return Err(checkpoint_record_not_found(mirror_name));
        };

        for (table, phase) in updates {
            record.tables.insert(table, phase);
        }

        Ok(())
    }

    async fn delete_checkpoint_record(&self, mirror_name: &str) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.checkpoints.remove(mirror_name);

        Ok(())
    }
}
