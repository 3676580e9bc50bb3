//! Connectors with scripted failures.
//!
//! [`FaultySource`] and [`FaultyDestination`] wrap the memory connectors and fail or delay chosen
//! calls, counting every call they receive.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::connector::memory::{MemoryDestination, MemorySession, MemorySource};
use crate::connector::{Connector, Destination, Source};
use crate::error::{ErrorKind, MirrorResult};
use crate::mirror_error;
use crate::state::checkpoint::Checkpoint;
use crate::types::{ChangeBatch, DestinationEvent, Position, TableName, TableRow};

#[derive(Debug, Default)]
struct DestinationFaults {
    failing_connects: u32,
    failing_health_checks: u32,
    failing_applies: Vec<ErrorKind>,
    apply_delay: Option<Duration>,
    calls: HashMap<&'static str, u64>,
}

/// A [`MemoryDestination`] that fails or delays scripted calls.
#[derive(Debug, Clone)]
pub struct FaultyDestination {
    inner: MemoryDestination,
    faults: Arc<Mutex<DestinationFaults>>,
}

impl FaultyDestination {
    pub fn wrap(inner: MemoryDestination) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(DestinationFaults::default())),
        }
    }

    pub fn inner(&self) -> &MemoryDestination {
        &self.inner
    }

    /// Makes the next `count` connection attempts fail.
    pub async fn fail_next_connects(&self, count: u32) {
        self.faults.lock().await.failing_connects = count;
    }

    /// Makes the next `count` health checks fail while connecting keeps working.
    pub async fn fail_next_health_checks(&self, count: u32) {
        self.faults.lock().await.failing_health_checks = count;
    }

    /// Makes the next applies fail, one per given kind, in order.
    pub async fn fail_next_applies(&self, kinds: impl IntoIterator<Item = ErrorKind>) {
        let mut faults = self.faults.lock().await;
        faults.failing_applies = kinds.into_iter().collect();
        faults.failing_applies.reverse();
    }

    /// Delays every apply by `delay` before it reaches the destination.
    pub async fn delay_applies(&self, delay: Option<Duration>) {
        self.faults.lock().await.apply_delay = delay;
    }

    /// Returns how often `method` was called.
    pub async fn calls(&self, method: &str) -> u64 {
        self.faults
            .lock()
            .await
            .calls
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    async fn record_call(&self, method: &'static str) {
        *self.faults.lock().await.calls.entry(method).or_default() += 1;
    }
}

impl Connector for FaultyDestination {
    type Session = MemorySession;

    fn kind() -> &'static str {
        "faulty_memory"
    }

    async fn connect(&self) -> MirrorResult<MemorySession> {
        self.record_call("connect").await;

        {
            let mut faults = self.faults.lock().await;
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(mirror_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Destination is unreachable",
                    "The scripted connection failure was triggered"
                ));
            }
        }

        self.inner.connect().await
    }

    async fn health_check(&self, session: &MemorySession) -> MirrorResult<()> {
        self.record_call("health_check").await;

        {
            let mut faults = self.faults.lock().await;
            if faults.failing_health_checks > 0 {
                faults.failing_health_checks -= 1;
                return Err(mirror_error!(
                    ErrorKind::DestinationConnectionFailed,
                    "Destination session is unhealthy",
                    "The scripted health check failure was triggered"
                ));
            }
        }

        self.inner.health_check(session).await
    }

    async fn disconnect(&self, session: MemorySession) {
        self.record_call("disconnect").await;
        self.inner.disconnect(session).await
    }
}

impl Destination for FaultyDestination {
    async fn apply_batch(
        &self,
        session: &MemorySession,
        mirror_name: &str,
        events: Vec<DestinationEvent>,
        target: &Checkpoint,
    ) -> MirrorResult<Checkpoint> {
        self.record_call("apply_batch").await;

        let (failure, delay) = {
            let mut faults = self.faults.lock().await;
            (faults.failing_applies.pop(), faults.apply_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(kind) = failure {
            return Err(mirror_error!(
                kind,
                "Destination rejected the batch",
                "The scripted apply failure was triggered"
            ));
        }

        self.inner
            .apply_batch(session, mirror_name, events, target)
            .await
    }

    async fn read_checkpoint(
        &self,
        session: &MemorySession,
        mirror_name: &str,
    ) -> MirrorResult<Option<Checkpoint>> {
        self.inner.read_checkpoint(session, mirror_name).await
    }

    async fn drop_checkpoint(&self, session: &MemorySession, mirror_name: &str) -> MirrorResult<()> {
        self.record_call("drop_checkpoint").await;
        self.inner.drop_checkpoint(session, mirror_name).await
    }

    async fn truncate_table(&self, session: &MemorySession, table: &str) -> MirrorResult<()> {
        self.inner.truncate_table(session, table).await
    }

    async fn write_table_rows(
        &self,
        session: &MemorySession,
        table: &str,
        rows: Vec<TableRow>,
    ) -> MirrorResult<()> {
        self.record_call("write_table_rows").await;
        self.inner.write_table_rows(session, table, rows).await
    }
}

#[derive(Debug, Default)]
struct SourceFaults {
    failing_connects: u32,
    failing_snapshots: HashSet<TableName>,
    snapshot_page_delay: Option<Duration>,
    calls: HashMap<&'static str, u64>,
}

/// A [`MemorySource`] that fails or delays scripted calls.
#[derive(Debug, Clone)]
pub struct FaultySource {
    inner: MemorySource,
    faults: Arc<Mutex<SourceFaults>>,
}

impl FaultySource {
    pub fn wrap(inner: MemorySource) -> Self {
        Self {
            inner,
            faults: Arc::new(Mutex::new(SourceFaults::default())),
        }
    }

    pub fn inner(&self) -> &MemorySource {
        &self.inner
    }

    /// Makes the next `count` connection attempts fail.
    pub async fn fail_next_connects(&self, count: u32) {
        self.faults.lock().await.failing_connects = count;
    }

    /// Makes reading the snapshot of `table` fail until [`FaultySource::heal_snapshot`].
    pub async fn fail_snapshot(&self, table: &TableName) {
        self.faults
            .lock()
            .await
            .failing_snapshots
            .insert(table.clone());
    }

    pub async fn heal_snapshot(&self, table: &TableName) {
        self.faults.lock().await.failing_snapshots.remove(table);
    }

    /// Delays every snapshot page by `delay`.
    pub async fn delay_snapshot_pages(&self, delay: Option<Duration>) {
        self.faults.lock().await.snapshot_page_delay = delay;
    }

    /// Returns how often `method` was called.
    pub async fn calls(&self, method: &str) -> u64 {
        self.faults
            .lock()
            .await
            .calls
            .get(method)
            .copied()
            .unwrap_or_default()
    }

    async fn record_call(&self, method: &'static str) {
        *self.faults.lock().await.calls.entry(method).or_default() += 1;
    }
}

impl Connector for FaultySource {
    type Session = MemorySession;

    fn kind() -> &'static str {
        "faulty_memory"
    }

    async fn connect(&self) -> MirrorResult<MemorySession> {
        self.record_call("connect").await;

        {
            let mut faults = self.faults.lock().await;
            if faults.failing_connects > 0 {
                faults.failing_connects -= 1;
                return Err(mirror_error!(
                    ErrorKind::SourceConnectionFailed,
                    "Source is unreachable",
                    "The scripted connection failure was triggered"
                ));
            }
        }

        self.inner.connect().await
    }

    async fn health_check(&self, session: &MemorySession) -> MirrorResult<()> {
        self.record_call("health_check").await;
        self.inner.health_check(session).await
    }

    async fn disconnect(&self, session: MemorySession) {
        self.record_call("disconnect").await;
        self.inner.disconnect(session).await
    }
}

impl Source for FaultySource {
    async fn create_retention(
        &self,
        session: &MemorySession,
        mirror_name: &str,
    ) -> MirrorResult<Position> {
        self.inner.create_retention(session, mirror_name).await
    }

    async fn advance_retention(
        &self,
        session: &MemorySession,
        mirror_name: &str,
        position: Position,
    ) -> MirrorResult<()> {
        self.inner
            .advance_retention(session, mirror_name, position)
            .await
    }

    async fn drop_retention(&self, session: &MemorySession, mirror_name: &str) -> MirrorResult<()> {
        self.record_call("drop_retention").await;
        self.inner.drop_retention(session, mirror_name).await
    }

    async fn read_changes(
        &self,
        session: &MemorySession,
        mirror_name: &str,
        cursors: &[(TableName, Position)],
        limit: usize,
    ) -> MirrorResult<ChangeBatch> {
        self.inner
            .read_changes(session, mirror_name, cursors, limit)
            .await
    }

    async fn export_snapshot(
        &self,
        session: &MemorySession,
        mirror_name: &str,
        table: &TableName,
    ) -> MirrorResult<Position> {
        self.record_call("export_snapshot").await;
        self.inner.export_snapshot(session, mirror_name, table).await
    }

    async fn read_snapshot(
        &self,
        session: &MemorySession,
        mirror_name: &str,
        table: &TableName,
        after_key: Option<&str>,
        limit: usize,
    ) -> MirrorResult<Vec<TableRow>> {
        self.record_call("read_snapshot").await;

        let (failing, delay) = {
            let faults = self.faults.lock().await;
            (
                faults.failing_snapshots.contains(table),
                faults.snapshot_page_delay,
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if failing {
            return Err(mirror_error!(
                ErrorKind::SnapshotFailed,
                "Snapshot could not be read",
                format!("The scripted snapshot failure of table {table} was triggered")
            ));
        }

        self.inner
            .read_snapshot(session, mirror_name, table, after_key, limit)
            .await
    }

    async fn release_snapshot(
        &self,
        session: &MemorySession,
        mirror_name: &str,
        table: &TableName,
    ) -> MirrorResult<()> {
        self.inner.release_snapshot(session, mirror_name, table).await
    }
}
