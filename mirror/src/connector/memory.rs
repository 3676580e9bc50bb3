use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bail;
use crate::connector::{Connector, Destination, Source};
use crate::error::{ErrorKind, MirrorResult};
use crate::state::checkpoint::Checkpoint;
use crate::types::{
    Change, ChangeBatch, ChangeEvent, DestinationEvent, Position, TableName, TableRow,
};

/// Counters of the sessions opened through a memory connector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub connects: u64,
    pub disconnects: u64,
    pub open: u64,
}

/// A session of a memory connector.
#[derive(Debug)]
pub struct MemorySession {
    id: u64,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default)]
struct Sessions {
    reachable: bool,
    next_id: u64,
    stats: ConnectionStats,
}

impl Sessions {
    fn new() -> Self {
        Self {
            reachable: true,
            ..Default::default()
        }
    }

    fn connect(&mut self, kind: ErrorKind) -> MirrorResult<MemorySession> {
        self.check(kind)?;

        self.next_id += 1;
        self.stats.connects += 1;
        self.stats.open += 1;

        Ok(MemorySession { id: self.next_id })
    }

    fn disconnect(&mut self) {
        self.stats.disconnects += 1;
        self.stats.open = self.stats.open.saturating_sub(1);
    }

    fn check(&self, kind: ErrorKind) -> MirrorResult<()> {
        if !self.reachable {
            bail!(kind, "Memory backend is unreachable");
        }

        Ok(())
    }
}

#[derive(Debug)]
struct SourceInner {
    sessions: Sessions,
    head: Position,
    tables: BTreeSet<TableName>,
    /// Table contents as of `compacted_through`.
    base: BTreeMap<TableName, BTreeMap<String, TableRow>>,
    /// Changes after `compacted_through`, ordered by position.
    log: VecDeque<ChangeEvent>,
    compacted_through: Position,
    retentions: HashMap<String, Position>,
    pins: HashMap<(String, TableName), Position>,
}

impl SourceInner {
    fn record(&mut self, table: &TableName, change: Change) -> Position {
        self.head = self.head.next();
        self.tables.insert(table.clone());
        self.log.push_back(ChangeEvent {
            position: self.head,
            table: table.clone(),
            change,
        });

        self.head
    }

    /// Folds every change no retention or pinned snapshot needs into the table contents.
    fn compact(&mut self) {
        let floor = self
            .retentions
            .values()
            .chain(self.pins.values())
            .min()
            .copied()
            .unwrap_or(self.head);

        if floor <= self.compacted_through {
            return;
        }

        while self
            .log
            .front()
            .is_some_and(|event| event.position <= floor)
        {
            if let Some(event) = self.log.pop_front() {
                fold_change(self.base.entry(event.table).or_default(), event.change);
            }
        }
        self.compacted_through = floor;

        debug!(compacted_through = %floor, "memory source compacted its change log");
    }

    fn rows_at(&self, table: &TableName, position: Position) -> BTreeMap<String, TableRow> {
        let mut rows = self.base.get(table).cloned().unwrap_or_default();
        for event in self
            .log
            .iter()
            .take_while(|event| event.position <= position)
            .filter(|event| &event.table == table)
        {
            fold_change(&mut rows, event.change.clone());
        }

        rows
    }
}

fn fold_change(rows: &mut BTreeMap<String, TableRow>, change: Change) {
    match change {
        Change::Insert { row } | Change::Update { row } => {
            rows.insert(row.key.clone(), row);
        }
        Change::Delete { key } => {
            rows.remove(&key);
        }
    }
}

/// In-memory source for testing and development purposes.
///
/// [`MemorySource`] keeps an ordered change log and the contents of its tables. Changes are
/// discarded once no retention and no pinned snapshot needs them anymore, and reading discarded
/// changes fails with [`ErrorKind::ChangesDiscarded`], so lost changes are observable.
#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<SourceInner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        let inner = SourceInner {
            sessions: Sessions::new(),
            head: Position::ZERO,
            tables: BTreeSet::new(),
            base: BTreeMap::new(),
            log: VecDeque::new(),
            compacted_through: Position::ZERO,
            retentions: HashMap::new(),
            pins: HashMap::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Creates an empty table.
    pub async fn create_table(&self, table: &TableName) {
        let mut inner = self.inner.lock().await;
        inner.tables.insert(table.clone());
    }

    /// Records an insert of `row` into `table` and returns its position.
    pub async fn insert(&self, table: &TableName, row: TableRow) -> Position {
        self.record(table, Change::Insert { row }).await
    }

    /// Records an update of `row` in `table` and returns its position.
    pub async fn update(&self, table: &TableName, row: TableRow) -> Position {
        self.record(table, Change::Update { row }).await
    }

    /// Records the deletion of the row with `key` from `table` and returns its position.
    pub async fn delete(&self, table: &TableName, key: impl Into<String>) -> Position {
        self.record(table, Change::Delete { key: key.into() }).await
    }

    pub async fn record(&self, table: &TableName, change: Change) -> Position {
        let mut inner = self.inner.lock().await;
        inner.record(table, change)
    }

    /// Returns the position of the latest recorded change.
    pub async fn head(&self) -> Position {
        self.inner.lock().await.head
    }

    /// Returns the position up to which changes were discarded.
    pub async fn compacted_through(&self) -> Position {
        self.inner.lock().await.compacted_through
    }

    /// Returns the retention position of `mirror_name`.
    pub async fn retention(&self, mirror_name: &str) -> Option<Position> {
        self.inner
            .lock()
            .await
            .retentions
            .get(mirror_name)
            .copied()
    }

    /// Returns the tables with a snapshot pinned for `mirror_name`.
    pub async fn pinned_snapshots(&self, mirror_name: &str) -> BTreeMap<TableName, Position> {
        let inner = self.inner.lock().await;
        inner
            .pins
            .iter()
            .filter(|((mirror, _), _)| mirror == mirror_name)
            .map(|((_, table), position)| (table.clone(), *position))
            .collect()
    }

    /// Returns the current contents of `table`.
    pub async fn table_rows(&self, table: &TableName) -> BTreeMap<String, serde_json::Value> {
        let inner = self.inner.lock().await;
        inner
            .rows_at(table, inner.head)
            .into_iter()
            .map(|(key, row)| (key, row.data))
            .collect()
    }

    /// Makes new sessions and requests fail with a connection error.
    pub async fn set_reachable(&self, reachable: bool) {
        self.inner.lock().await.sessions.reachable = reachable;
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        self.inner.lock().await.sessions.stats
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemorySource {
    type Session = MemorySession;

    fn kind() -> &'static str {
        "memory"
    }

    async fn connect(&self) -> MirrorResult<MemorySession> {
        let mut inner = self.inner.lock().await;
        inner
            .sessions
            .connect(ErrorKind::SourceConnectionFailed)
    }

    async fn health_check(&self, _session: &MemorySession) -> MirrorResult<()> {
        let inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)
    }

    async fn disconnect(&self, _session: MemorySession) {
        let mut inner = self.inner.lock().await;
        inner.sessions.disconnect();
    }
}

impl Source for MemorySource {
    async fn create_retention(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
    ) -> MirrorResult<Position> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        let head = inner.head;
        let position = *inner
            .retentions
            .entry(mirror_name.to_string())
            .or_insert(head);

        Ok(position)
    }

    async fn advance_retention(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
        position: Position,
    ) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        let Some(retention) = inner.retentions.get_mut(mirror_name) else {
            bail!(
                ErrorKind::InvalidState,
                "Change retention does not exist",
                format!("No change retention was created for mirror {mirror_name}")
            );
        };
        *retention = (*retention).max(position);
        inner.compact();

        Ok(())
    }

    async fn drop_retention(&self, _session: &MemorySession, mirror_name: &str) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        inner.retentions.remove(mirror_name);
        inner.pins.retain(|(mirror, _), _| mirror != mirror_name);
        inner.compact();

        info!(mirror_name, "memory source dropped change retention");

        Ok(())
    }

    async fn read_changes(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
        cursors: &[(TableName, Position)],
        limit: usize,
    ) -> MirrorResult<ChangeBatch> {
        let inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        for (table, cursor) in cursors {
            if *cursor < inner.compacted_through {
                bail!(
                    ErrorKind::ChangesDiscarded,
                    "Changes requested by the mirror were discarded",
                    format!(
                        "Mirror {mirror_name} requested changes of table {table} after {cursor} but the source discarded changes up to {}",
                        inner.compacted_through
                    )
                );
            }
        }

        let cursors: HashMap<&TableName, Position> = cursors
            .iter()
            .map(|(table, cursor)| (table, *cursor))
            .collect();
        let events: Vec<ChangeEvent> = inner
            .log
            .iter()
            .filter(|event| {
                cursors
                    .get(&event.table)
                    .is_some_and(|cursor| event.position > *cursor)
            })
            .take(limit)
            .cloned()
            .collect();

        let through = match events.last() {
            Some(last) if events.len() == limit => last.position,
            _ => inner.head,
        };

        Ok(ChangeBatch { events, through })
    }

    async fn export_snapshot(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
        table: &TableName,
    ) -> MirrorResult<Position> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        if !inner.tables.contains(table) {
            bail!(
                ErrorKind::SnapshotFailed,
                "Table does not exist in the source",
                format!("Table {table} cannot be snapshotted because it does not exist")
            );
        }

        let head = inner.head;
        let position = *inner
            .pins
            .entry((mirror_name.to_string(), table.clone()))
            .or_insert(head);

        Ok(position)
    }

    async fn read_snapshot(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
        table: &TableName,
        after_key: Option<&str>,
        limit: usize,
    ) -> MirrorResult<Vec<TableRow>> {
        let inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        let Some(position) = inner
            .pins
            .get(&(mirror_name.to_string(), table.clone()))
            .copied()
        else {
            bail!(
                ErrorKind::InvalidState,
                "Snapshot was not exported",
                format!("No snapshot of table {table} is pinned for mirror {mirror_name}")
            );
        };

        let rows = inner
            .rows_at(table, position)
            .into_values()
            .filter(|row| after_key.is_none_or(|after_key| row.key.as_str() > after_key))
            .take(limit)
            .collect();

        Ok(rows)
    }

    async fn release_snapshot(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
        table: &TableName,
    ) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::SourceConnectionFailed)?;

        inner.pins.remove(&(mirror_name.to_string(), table.clone()));
        inner.compact();

        Ok(())
    }
}

#[derive(Debug)]
struct DestinationInner {
    sessions: Sessions,
    tables: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    applied_events: Vec<DestinationEvent>,
    applied_batch_sizes: Vec<usize>,
    checkpoints: HashMap<String, Checkpoint>,
}

/// In-memory destination for testing and development purposes.
///
/// [`MemoryDestination`] applies batches and stores checkpoints under one lock, so a batch and its
/// checkpoint are always applied together. Every applied event is also kept in order for
/// inspection.
#[derive(Debug, Clone)]
pub struct MemoryDestination {
    inner: Arc<Mutex<DestinationInner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        let inner = DestinationInner {
            sessions: Sessions::new(),
            tables: BTreeMap::new(),
            applied_events: Vec::new(),
            applied_batch_sizes: Vec::new(),
            checkpoints: HashMap::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Returns the current contents of `table`.
    pub async fn table_rows(&self, table: &str) -> BTreeMap<String, serde_json::Value> {
        let inner = self.inner.lock().await;
        inner.tables.get(table).cloned().unwrap_or_default()
    }

    /// Returns every event applied so far, in application order.
    pub async fn applied_events(&self) -> Vec<DestinationEvent> {
        self.inner.lock().await.applied_events.clone()
    }

    /// Returns the number of events of every non-empty batch applied so far.
    pub async fn applied_batch_sizes(&self) -> Vec<usize> {
        self.inner.lock().await.applied_batch_sizes.clone()
    }

    pub async fn checkpoint(&self, mirror_name: &str) -> Option<Checkpoint> {
        self.inner
            .lock()
            .await
            .checkpoints
            .get(mirror_name)
            .cloned()
    }

    /// Makes new sessions and requests fail with a connection error.
    pub async fn set_reachable(&self, reachable: bool) {
        self.inner.lock().await.sessions.reachable = reachable;
    }

    pub async fn connection_stats(&self) -> ConnectionStats {
        self.inner.lock().await.sessions.stats
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for MemoryDestination {
    type Session = MemorySession;

    fn kind() -> &'static str {
        "memory"
    }

    async fn connect(&self) -> MirrorResult<MemorySession> {
        let mut inner = self.inner.lock().await;
        inner
            .sessions
            .connect(ErrorKind::DestinationConnectionFailed)
    }

    async fn health_check(&self, _session: &MemorySession) -> MirrorResult<()> {
        let inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::DestinationConnectionFailed)
    }

    async fn disconnect(&self, _session: MemorySession) {
        let mut inner = self.inner.lock().await;
        inner.sessions.disconnect();
    }
}

impl Destination for MemoryDestination {
    async fn apply_batch(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
        events: Vec<DestinationEvent>,
        target: &Checkpoint,
    ) -> MirrorResult<Checkpoint> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::DestinationConnectionFailed)?;

        for event in &events {
            let rows = inner.tables.entry(event.table.clone()).or_default();
            match &event.change {
                Change::Insert { row } | Change::Update { row } => {
                    rows.insert(row.key.clone(), row.data.clone());
                }
                Change::Delete { key } => {
                    rows.remove(key);
                }
            }
        }
        if !events.is_empty() {
            inner.applied_batch_sizes.push(events.len());
        }
        inner.applied_events.extend(events);
        inner
            .checkpoints
            .insert(mirror_name.to_string(), target.clone());

        Ok(target.clone())
    }

    async fn read_checkpoint(
        &self,
        _session: &MemorySession,
        mirror_name: &str,
    ) -> MirrorResult<Option<Checkpoint>> {
        let inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::DestinationConnectionFailed)?;

        Ok(inner.checkpoints.get(mirror_name).cloned())
    }

    async fn drop_checkpoint(&self, _session: &MemorySession, mirror_name: &str) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::DestinationConnectionFailed)?;

        inner.checkpoints.remove(mirror_name);

        Ok(())
    }

    async fn truncate_table(&self, _session: &MemorySession, table: &str) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::DestinationConnectionFailed)?;

        inner.tables.insert(table.to_string(), BTreeMap::new());

        Ok(())
    }

    async fn write_table_rows(
        &self,
        _session: &MemorySession,
        table: &str,
        rows: Vec<TableRow>,
    ) -> MirrorResult<()> {
        let mut inner = self.inner.lock().await;
        inner.sessions.check(ErrorKind::DestinationConnectionFailed)?;

        let table_rows = inner.tables.entry(table.to_string()).or_default();
        for row in rows {
            table_rows.insert(row.key, row.data);
        }

        Ok(())
    }
}
