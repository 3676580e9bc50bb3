use serde::{Deserialize, Serialize};

use crate::types::{Position, TableName};

/// A row of a table, identified by its primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    /// Rendered primary key of the row.
    pub key: String,
    /// Column values of the row.
    pub data: serde_json::Value,
}

impl TableRow {
    pub fn new(key: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            data,
        }
    }
}

/// A row-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Insert { row: TableRow },
    Update { row: TableRow },
    Delete { key: String },
}

impl Change {
    /// Returns the primary key of the row the change touches.
    pub fn key(&self) -> &str {
        match self {
            Change::Insert { row } | Change::Update { row } => &row.key,
            Change::Delete { key } => key,
        }
    }
}

/// A change captured by a source at a given position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub position: Position,
    pub table: TableName,
    pub change: Change,
}

/// A change addressed to a destination table, as handed to
/// [`crate::connector::Destination::apply_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationEvent {
    /// Source position of the change.
    pub position: Position,
    /// Name of the destination table receiving the change.
    pub table: String,
    pub change: Change,
}

/// Changes read from a source in one call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeBatch {
    /// Events ordered by position.
    pub events: Vec<ChangeEvent>,
    /// Position through which the read is complete.
    ///
    /// Every change of a requested table that lies after the table's cursor and at or before this
    /// position is part of `events`.
    pub through: Position,
}
