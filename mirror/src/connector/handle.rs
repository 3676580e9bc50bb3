use std::mem;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bail;
use crate::connector::{Connector, Destination, Source};
use crate::error::{ErrorKind, MirrorResult};
use crate::state::checkpoint::Checkpoint;
use crate::types::{ChangeBatch, DestinationEvent, Position, TableName, TableRow};

/// Which side of a mirror a handle connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorRole {
    Source,
    Destination,
}

impl ConnectorRole {
    fn connection_error_kind(&self) -> ErrorKind {
        match self {
            ConnectorRole::Source => ErrorKind::SourceConnectionFailed,
            ConnectorRole::Destination => ErrorKind::DestinationConnectionFailed,
        }
    }
}

enum HandleState<T> {
    Unconnected,
    Open(T),
    Closed,
}

/// An exclusively owned session to a backend.
///
/// A handle starts unconnected and only serves requests while open. Closing is
/// total: it releases an open session exactly once and does nothing otherwise, and every request
/// on a handle that is not open fails with a connection error.
pub struct ConnectorHandle<C>
where
    C: Connector,
{
    connector: Arc<C>,
    role: ConnectorRole,
    state: HandleState<C::Session>,
}

impl<C> ConnectorHandle<C>
where
    C: Connector,
{
    fn new(connector: Arc<C>, role: ConnectorRole) -> Self {
        Self {
            connector,
            role,
            state: HandleState::Unconnected,
        }
    }

    pub fn role(&self) -> ConnectorRole {
        self.role
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }

    pub fn is_unconnected(&self) -> bool {
        matches!(self.state, HandleState::Unconnected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, HandleState::Closed)
    }

    /// Opens a session to the backend.
    ///
    /// Opening an open handle keeps its session. A failed open leaves the handle without a session.
    pub async fn open(&mut self) -> MirrorResult<()> {
        if self.is_open() {
            return Ok(());
        }

        let session = self.connector.connect().await?;
        self.state = HandleState::Open(session);
        debug!(kind = C::kind(), role = ?self.role, "connector session opened");

        Ok(())
    }

    /// Checks the liveness of the session.
    pub async fn health_check(&self) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector.health_check(session).await
    }

    /// Releases the session if the handle is open.
    pub async fn close(&mut self) {
        match mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Open(session) => {
                self.connector.disconnect(session).await;
                debug!(kind = C::kind(), role = ?self.role, "connector session closed");
            }
            HandleState::Unconnected | HandleState::Closed => {}
        }
    }

    fn session(&self) -> MirrorResult<&C::Session> {
        match &self.state {
            HandleState::Open(session) => Ok(session),
            HandleState::Unconnected => bail!(
                self.role.connection_error_kind(),
                "Connector handle is not connected",
                format!("The {} connector was never opened", C::kind())
            ),
            HandleState::Closed => bail!(
                self.role.connection_error_kind(),
                "Connector handle is closed",
                format!("The {} connector was already closed", C::kind())
            ),
        }
    }
}

impl<C> Drop for ConnectorHandle<C>
where
    C: Connector,
{
    fn drop(&mut self) {
        if self.is_open() {
            warn!(
                kind = C::kind(),
                role = ?self.role,
                "connector handle dropped while open, the session was not released"
            );
        }
    }
}

impl<S> ConnectorHandle<S>
where
    S: Source,
{
    /// Creates an unconnected handle to a source.
    pub fn source(connector: Arc<S>) -> Self {
        Self::new(connector, ConnectorRole::Source)
    }

    pub async fn create_retention(&self, mirror_name: &str) -> MirrorResult<Position> {
        let session = self.session()?;
        self.connector.create_retention(session, mirror_name).await
    }

    pub async fn advance_retention(&self, mirror_name: &str, position: Position) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector
            .advance_retention(session, mirror_name, position)
            .await
    }

    pub async fn drop_retention(&self, mirror_name: &str) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector.drop_retention(session, mirror_name).await
    }

    pub async fn read_changes(
        &self,
        mirror_name: &str,
        cursors: &[(TableName, Position)],
        limit: usize,
    ) -> MirrorResult<ChangeBatch> {
        let session = self.session()?;
        self.connector
            .read_changes(session, mirror_name, cursors, limit)
            .await
    }

    pub async fn export_snapshot(
        &self,
        mirror_name: &str,
        table: &TableName,
    ) -> MirrorResult<Position> {
        let session = self.session()?;
        self.connector
            .export_snapshot(session, mirror_name, table)
            .await
    }

    pub async fn read_snapshot(
        &self,
        mirror_name: &str,
        table: &TableName,
        after_key: Option<&str>,
        limit: usize,
    ) -> MirrorResult<Vec<TableRow>> {
        let session = self.session()?;
        self.connector
            .read_snapshot(session, mirror_name, table, after_key, limit)
            .await
    }

    pub async fn release_snapshot(&self, mirror_name: &str, table: &TableName) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector
            .release_snapshot(session, mirror_name, table)
            .await
    }
}

impl<D> ConnectorHandle<D>
where
    D: Destination,
{
    /// Creates an unconnected handle to a destination.
    pub fn destination(connector: Arc<D>) -> Self {
        Self::new(connector, ConnectorRole::Destination)
    }

    pub async fn apply_batch(
        &self,
        mirror_name: &str,
        events: Vec<DestinationEvent>,
        target: &Checkpoint,
    ) -> MirrorResult<Checkpoint> {
        let session = self.session()?;
        self.connector
            .apply_batch(session, mirror_name, events, target)
            .await
    }

    pub async fn read_checkpoint(&self, mirror_name: &str) -> MirrorResult<Option<Checkpoint>> {
        let session = self.session()?;
        self.connector.read_checkpoint(session, mirror_name).await
    }

    pub async fn drop_checkpoint(&self, mirror_name: &str) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector.drop_checkpoint(session, mirror_name).await
    }

    pub async fn truncate_table(&self, table: &str) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector.truncate_table(session, table).await
    }

    pub async fn write_table_rows(&self, table: &str, rows: Vec<TableRow>) -> MirrorResult<()> {
        let session = self.session()?;
        self.connector.write_table_rows(session, table, rows).await
    }
}
