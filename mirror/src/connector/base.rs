use std::future::Future;

use crate::error::MirrorResult;
use crate::state::checkpoint::Checkpoint;
use crate::types::{ChangeBatch, DestinationEvent, Position, TableName, TableRow};

/// Capabilities shared by every backend a mirror connects to.
///
/// A connector is a factory of sessions. Sessions are owned through a
/// [`crate::connector::ConnectorHandle`], which is the only way the control plane opens, checks and
/// releases them.
pub trait Connector {
    /// An open session to the backend.
    type Session: Send + Sync;

    /// Returns the kind of backend, reported as the destination type of a mirror.
    fn kind() -> &'static str;

    /// Establishes and validates a session, including selecting the target namespace.
    ///
    /// Must fail rather than return a session that cannot serve requests.
    fn connect(&self) -> impl Future<Output = MirrorResult<Self::Session>> + Send;

    /// Verifies that the session is alive and its namespace still reachable.
    fn health_check(&self, session: &Self::Session)
    -> impl Future<Output = MirrorResult<()>> + Send;

    /// Releases the session.
    fn disconnect(&self, session: Self::Session) -> impl Future<Output = ()> + Send;
}

/// A backend capturing row-level changes.
///
/// The source retains changes per mirror: nothing after the retention position of a mirror, or after
/// a snapshot pinned for one of its tables, is discarded.
pub trait Source: Connector {
    /// Creates the change retention of `mirror_name` at the current position and returns it.
    ///
    /// When the retention already exists, its current position is returned unchanged.
    fn create_retention(
        &self,
        session: &Self::Session,
        mirror_name: &str,
    ) -> impl Future<Output = MirrorResult<Position>> + Send;

    /// Lets the source discard the changes of `mirror_name` up to `position`.
    fn advance_retention(
        &self,
        session: &Self::Session,
        mirror_name: &str,
        position: Position,
    ) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Removes the retention of `mirror_name` and every snapshot pinned for it.
    fn drop_retention(
        &self,
        session: &Self::Session,
        mirror_name: &str,
    ) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Reads the changes of the given tables, each after its own cursor.
    ///
    /// Returns at most `limit` events ordered by position.
    fn read_changes(
        &self,
        session: &Self::Session,
        mirror_name: &str,
        cursors: &[(TableName, Position)],
        limit: usize,
    ) -> impl Future<Output = MirrorResult<ChangeBatch>> + Send;

    /// Exports a consistent snapshot of `table` and pins the changes after it.
    ///
    /// Returns the position the snapshot reflects. Exporting an already exported table returns the
    /// existing snapshot position.
    fn export_snapshot(
        &self,
        session: &Self::Session,
        mirror_name: &str,
        table: &TableName,
    ) -> impl Future<Output = MirrorResult<Position>> + Send;

    /// Reads up to `limit` rows of an exported snapshot, ordered by key and starting after
    /// `after_key`.
    fn read_snapshot(
        &self,
        session: &Self::Session,
        mirror_name: &str,
        table: &TableName,
        after_key: Option<&str>,
        limit: usize,
    ) -> impl Future<Output = MirrorResult<Vec<TableRow>>> + Send;

    /// Releases the snapshot pinned for `table`.
    fn release_snapshot(
        &self,
        session: &Self::Session,
        mirror_name: &str,
        table: &TableName,
    ) -> impl Future<Output = MirrorResult<()>> + Send;
}

/// A backend receiving the changes of a mirror.
pub trait Destination: Connector {
    /// Applies a contiguous batch of events and stores `target` as the mirror's checkpoint.
    ///
    /// Either the whole batch and the checkpoint are applied together, or nothing changes and the
    /// prior checkpoint stays valid for a retry. Returns the stored checkpoint.
    fn apply_batch(
        &self,
        session: &Self::Session,
        mirror_name: &str,
        events: Vec<DestinationEvent>,
        target: &Checkpoint,
    ) -> impl Future<Output = MirrorResult<Checkpoint>> + Send;

    /// Returns the last checkpoint stored by [`Destination::apply_batch`] for `mirror_name`.
    fn read_checkpoint(
        &self,
        session: &Self::Session,
        mirror_name: &str,
    ) -> impl Future<Output = MirrorResult<Option<Checkpoint>>> + Send;

    /// Removes the checkpoint stored for `mirror_name`.
    fn drop_checkpoint(
        &self,
        session: &Self::Session,
        mirror_name: &str,
    ) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Removes every row of `table`.
    ///
    /// Called before a snapshot copy, also when the table does not exist yet.
    fn truncate_table(
        &self,
        session: &Self::Session,
        table: &str,
    ) -> impl Future<Output = MirrorResult<()>> + Send;

    /// Writes snapshot rows into `table`.
    fn write_table_rows(
        &self,
        session: &Self::Session,
        table: &str,
        rows: Vec<TableRow>,
    ) -> impl Future<Output = MirrorResult<()>> + Send;
}
