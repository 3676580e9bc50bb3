use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use crate::error::MirrorResult;
use crate::state::checkpoint::CheckpointRecord;
use crate::state::mirror::MirrorState;
use crate::state::table::{TableSyncPhase, TableSyncPhaseType};
use crate::store::both::memory::MemoryStore;
use crate::store::catalog::{CatalogStore, MirrorRecord};
use crate::store::checkpoint::{CheckpointCommit, CheckpointStore};
use crate::test_utils::notify::TimedNotify;
use crate::types::TableName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreMethod {
    InsertMirror,
    UpdateMirror,
    UpdateMirrorStatus,
    DeleteMirror,
    CommitCheckpoint,
    UpdateTablePhases,
    DeleteCheckpointRecord,
}

struct MirrorStateCondition {
    mirror_name: String,
    expected: MirrorState,
    /// Index of the mirror history from which the expected state counts.
    since: usize,
    notify: Arc<Notify>,
}

type TablePhaseCondition = (
    String,
    TableName,
    Arc<Notify>,
    Box<dyn Fn(&TableSyncPhase) -> bool + Send + Sync>,
);

type CheckpointCondition = (
    String,
    Arc<Notify>,
    Box<dyn Fn(&CheckpointRecord) -> bool + Send + Sync>,
);

#[derive(Default)]
struct Conditions {
    mirror_state_conditions: Vec<MirrorStateCondition>,
    table_phase_conditions: Vec<TablePhaseCondition>,
    checkpoint_conditions: Vec<CheckpointCondition>,
    method_call_notifiers: HashMap<StoreMethod, Vec<Arc<Notify>>>,
}

/// A [`MemoryStore`] that notifies tests when mirrors and tables reach awaited states.
///
/// Conditions are checked after every write, a condition that already holds when it is
/// registered fires right away.
#[derive(Clone)]
pub struct NotifyingStore {
    store: MemoryStore,
    conditions: Arc<Mutex<Conditions>>,
}

impl NotifyingStore {
    pub fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            conditions: Arc::new(Mutex::new(Conditions::default())),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.store
    }

    pub async fn get_mirror_state_history(&self, name: &str) -> Vec<MirrorState> {
        self.store.get_mirror_state_history(name).await
    }

    /// Fires once mirror `name` is in, or from now on passes through, `expected`.
    pub async fn notify_on_mirror_state(&self, name: &str, expected: MirrorState) -> TimedNotify {
        let notify = Arc::new(Notify::new());
        let since = self
            .store
            .get_mirror_state_history(name)
            .await
            .len()
            .saturating_sub(1);

        let mut conditions = self.conditions.lock().await;
        conditions.mirror_state_conditions.push(MirrorStateCondition {
            mirror_name: name.to_string(),
            expected,
            since,
            notify: notify.clone(),
        });
        self.check_conditions(&mut conditions).await;

        TimedNotify::new(notify)
    }

    /// Fires once `table` of mirror `name` is in a phase of type `expected`.
    pub async fn notify_on_table_phase(
        &self,
        name: &str,
        table: &TableName,
        expected: TableSyncPhaseType,
    ) -> TimedNotify {
        self.notify_on_table_phase_matching(name, table, move |phase| phase.as_type() == expected)
            .await
    }

    /// Fires once the phase of `table` of mirror `name` satisfies `condition`.
    pub async fn notify_on_table_phase_matching<F>(
        &self,
        name: &str,
        table: &TableName,
        condition: F,
    ) -> TimedNotify
    where
        F: Fn(&TableSyncPhase) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());

        let mut conditions = self.conditions.lock().await;
        conditions.table_phase_conditions.push((
            name.to_string(),
            table.clone(),
            notify.clone(),
            Box::new(condition),
        ));
        self.check_conditions(&mut conditions).await;

        TimedNotify::new(notify)
    }

    /// Fires once mirror `name` completed at least `syncs` non-empty batches.
    pub async fn notify_on_syncs(&self, name: &str, syncs: u64) -> TimedNotify {
        self.notify_on_checkpoint_record(name, move |record| record.syncs_completed >= syncs)
            .await
    }

    /// Fires once the checkpoint record of mirror `name` satisfies `condition`.
    pub async fn notify_on_checkpoint_record<F>(&self, name: &str, condition: F) -> TimedNotify
    where
        F: Fn(&CheckpointRecord) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());

        let mut conditions = self.conditions.lock().await;
        conditions.checkpoint_conditions.push((
            name.to_string(),
            notify.clone(),
            Box::new(condition),
        ));
        self.check_conditions(&mut conditions).await;

        TimedNotify::new(notify)
    }

    /// Fires on the next call of `method`.
    pub async fn notify_on_method_call(&self, method: StoreMethod) -> TimedNotify {
        let notify = Arc::new(Notify::new());

        let mut conditions = self.conditions.lock().await;
        conditions
            .method_call_notifiers
            .entry(method)
            .or_default()
            .push(notify.clone());

        TimedNotify::new(notify)
    }

    async fn check_conditions(&self, conditions: &mut Conditions) {
        let mut histories = HashMap::new();
        for condition in &conditions.mirror_state_conditions {
            if !histories.contains_key(&condition.mirror_name) {
                let history = self
                    .store
                    .get_mirror_state_history(&condition.mirror_name)
                    .await;
                histories.insert(condition.mirror_name.clone(), history);
            }
        }
        conditions.mirror_state_conditions.retain(|condition| {
            let reached = histories
                .get(&condition.mirror_name)
                .and_then(|history| history.get(condition.since..))
                .is_some_and(|states| states.contains(&condition.expected));
            if reached {
                condition.notify.notify_one();
            }

            !reached
        });

        let mut records = HashMap::new();
        let names = conditions
            .table_phase_conditions
            .iter()
            .map(|(name, ..)| name)
            .chain(conditions.checkpoint_conditions.iter().map(|(name, ..)| name));
        for name in names {
            if !records.contains_key(name)
                && let Ok(Some(record)) = self.store.get_checkpoint_record(name).await
            {
                records.insert(name.clone(), record);
            }
        }
        conditions
            .table_phase_conditions
            .retain(|(name, table, notify, condition)| {
                let reached = records
                    .get(name)
                    .and_then(|record| record.tables.get(table))
                    .is_some_and(|phase| condition(phase));
                if reached {
                    notify.notify_one();
                }

                !reached
            });
        conditions
            .checkpoint_conditions
            .retain(|(name, notify, condition)| {
                let reached = records.get(name).is_some_and(|record| condition(record));
                if reached {
                    notify.notify_one();
                }

                !reached
            });
    }

    async fn after_write(&self, method: StoreMethod) {
        let mut conditions = self.conditions.lock().await;

        if let Some(notifiers) = conditions.method_call_notifiers.remove(&method) {
            for notifier in notifiers {
                notifier.notify_one();
            }
        }
        self.check_conditions(&mut conditions).await;
    }
}

impl fmt::Debug for NotifyingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyingStore")
            .field("store", &self.store)
            .finish()
    }
}

impl Default for NotifyingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogStore for NotifyingStore {
    async fn get_mirror(&self, name: &str) -> MirrorResult<Option<MirrorRecord>> {
        self.store.get_mirror(name).await
    }

    async fn get_mirrors(&self) -> MirrorResult<Vec<MirrorRecord>> {
        self.store.get_mirrors().await
    }

    async fn insert_mirror(&self, record: MirrorRecord) -> MirrorResult<()> {
        let result = self.store.insert_mirror(record).await;
        self.after_write(StoreMethod::InsertMirror).await;

        result
    }

    async fn update_mirror(&self, record: MirrorRecord) -> MirrorResult<()> {
        let result = self.store.update_mirror(record).await;
        self.after_write(StoreMethod::UpdateMirror).await;

        result
    }

    async fn update_mirror_status(&self, name: &str, status: MirrorState) -> MirrorResult<MirrorState> {
        let result = self.store.update_mirror_status(name, status).await;
        self.after_write(StoreMethod::UpdateMirrorStatus).await;

        result
    }

    async fn delete_mirror(&self, name: &str) -> MirrorResult<()> {
        let result = self.store.delete_mirror(name).await;
        self.after_write(StoreMethod::DeleteMirror).await;

        result
    }
}

impl CheckpointStore for NotifyingStore {
    async fn get_checkpoint_record(&self, mirror_name: &str) -> MirrorResult<Option<CheckpointRecord>> {
        self.store.get_checkpoint_record(mirror_name).await
    }

    async fn insert_checkpoint_record(
        &self,
        mirror_name: &str,
        record: CheckpointRecord,
    ) -> MirrorResult<()> {
        self.store
            .insert_checkpoint_record(mirror_name, record)
            .await
    }

    async fn commit_checkpoint(
        &self,
        mirror_name: &str,
        commit: CheckpointCommit,
    ) -> MirrorResult<CheckpointRecord> {
        let result = self.store.commit_checkpoint(mirror_name, commit).await;
        self.after_write(StoreMethod::CommitCheckpoint).await;

        result
    }

    async fn update_table_phases(
        &self,
        mirror_name: &str,
        updates: Vec<(TableName, TableSyncPhase)>,
    ) -> MirrorResult<()> {
        let result = self.store.update_table_phases(mirror_name, updates).await;
        self.after_write(StoreMethod::UpdateTablePhases).await;

        result
    }

    async fn delete_checkpoint_record(&self, mirror_name: &str) -> MirrorResult<()> {
        let result = self.store.delete_checkpoint_record(mirror_name).await;
        self.after_write(StoreMethod::DeleteCheckpointRecord).await;

        result
    }
}
