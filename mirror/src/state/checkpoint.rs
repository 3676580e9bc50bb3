use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::state::table::{TableSyncPhase, TableSyncPhaseType};
use crate::types::{Position, TableName};

/// How a table tracked by a [`Checkpoint`] is read from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TableCursor {
    /// The table is read from the mirror position like every other merged table.
    Merged,
    /// The table was snapshotted and is replaying the changes after its own cursor.
    CatchUp { cursor: Position },
}

/// The source position durably reflected in the destination.
///
/// Only tables present in `tables` are part of the mirror's batches. Every change of a merged table
/// up to `position` was applied, and every change of a catching-up table up to its cursor was
/// applied on top of its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub position: Position,
    pub tables: BTreeMap<TableName, TableCursor>,
}

/// The outcome of advancing a [`Checkpoint`] past a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointAdvance {
    pub checkpoint: Checkpoint,
    /// Tables whose catch-up finished with this advance.
    pub merged: Vec<TableName>,
}

impl Checkpoint {
    /// Creates a checkpoint at `position` where all `tables` are merged.
    pub fn new(position: Position, tables: impl IntoIterator<Item = TableName>) -> Self {
        Self {
            position,
            tables: tables
                .into_iter()
                .map(|table| (table, TableCursor::Merged))
                .collect(),
        }
    }

    pub fn contains(&self, table: &TableName) -> bool {
        self.tables.contains_key(table)
    }

    /// Admits a snapshotted table, replaying its changes after `start`.
    ///
    /// Returns `false`, leaving the checkpoint untouched, when the table is already tracked.
    pub fn admit(&mut self, table: TableName, start: Position) -> bool {
        if self.tables.contains_key(&table) {
            return false;
        }

        self.tables
            .insert(table, TableCursor::CatchUp { cursor: start });
        true
    }

    /// Returns the position each tracked table must be read from.
    pub fn read_cursors(&self) -> Vec<(TableName, Position)> {
        self.tables
            .iter()
            .map(|(table, cursor)| {
                let position = match cursor {
                    TableCursor::Merged => self.position,
                    TableCursor::CatchUp { cursor } => *cursor,
                };
                (table.clone(), position)
            })
            .collect()
    }

    /// Returns the tables still catching up.
    pub fn catching_up(&self) -> impl Iterator<Item = (&TableName, Position)> {
        self.tables.iter().filter_map(|(table, cursor)| match cursor {
            TableCursor::CatchUp { cursor } => Some((table, *cursor)),
            TableCursor::Merged => None,
        })
    }

    /// Returns the lowest position the source still has to retain for this checkpoint.
    pub fn low_watermark(&self) -> Position {
        self.catching_up()
            .map(|(_, cursor)| cursor)
            .fold(self.position, Position::min)
    }

    /// Advances the checkpoint past a read that is complete through `through`.
    ///
    /// A catching-up table is merged once its cursor meets the mirror position, from then on its
    /// changes are read from the mirror position.
    pub fn advance(&self, through: Position) -> CheckpointAdvance {
        let position = self.position.max(through);
        let mut merged = Vec::new();

        let tables = self
            .tables
            .iter()
            .map(|(table, cursor)| {
                let cursor = match cursor {
                    TableCursor::Merged => TableCursor::Merged,
                    TableCursor::CatchUp { cursor } => {
                        let cursor = (*cursor).max(through);
                        if cursor == position {
                            merged.push(table.clone());
                            TableCursor::Merged
                        } else {
                            TableCursor::CatchUp { cursor }
                        }
                    }
                };
                (table.clone(), cursor)
            })
            .collect();

        CheckpointAdvance {
            checkpoint: Checkpoint { position, tables },
            merged,
        }
    }
}

/// Everything the metadata store keeps for one mirror.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Last committed checkpoint, absent until the first run of the mirror established it.
    pub checkpoint: Option<Checkpoint>,
    /// Snapshot progress of every table of the mirror.
    pub tables: BTreeMap<TableName, TableSyncPhase>,
    /// Number of non-empty batches applied over the life of the mirror.
    pub syncs_completed: u64,
}

impl CheckpointRecord {
    /// Returns the tables with the given phase type.
    pub fn tables_in(
        &self,
        phase_type: TableSyncPhaseType,
    ) -> impl Iterator<Item = (&TableName, &TableSyncPhase)> {
        self.tables
            .iter()
            .filter(move |(_, phase)| phase.as_type() == phase_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str) -> TableName {
        TableName::parse(name).unwrap()
    }

    fn p(value: u64) -> Position {
        Position::new(value)
    }

    #[test]
    fn merged_tables_read_from_mirror_position() {
        let mut checkpoint = Checkpoint::new(p(10), [table("public.users")]);
        checkpoint.admit(table("public.orders"), p(4));

        assert_eq!(
            checkpoint.read_cursors(),
            vec![(table("public.orders"), p(4)), (table("public.users"), p(10))]
        );
        assert_eq!(checkpoint.low_watermark(), p(4));
    }

    #[test]
    fn admitting_a_tracked_table_is_a_no_op() {
        let mut checkpoint = Checkpoint::new(p(10), [table("public.users")]);

        assert!(!checkpoint.admit(table("public.users"), p(2)));
        assert_eq!(checkpoint.tables[&table("public.users")], TableCursor::Merged);
    }

    #[test]
    fn catch_up_behind_position_merges_when_read_reaches_position() {
        let mut checkpoint = Checkpoint::new(p(10), [table("public.users")]);
        checkpoint.admit(table("public.orders"), p(4));

        // A truncated read that stops before the mirror position.
        let advance = checkpoint.advance(p(7));
        assert!(advance.merged.is_empty());
        assert_eq!(advance.checkpoint.position, p(10));
        assert_eq!(
            advance.checkpoint.tables[&table("public.orders")],
            TableCursor::CatchUp { cursor: p(7) }
        );

        let advance = advance.checkpoint.advance(p(12));
        assert_eq!(advance.merged, vec![table("public.orders")]);
        assert_eq!(advance.checkpoint.position, p(12));
        assert_eq!(
            advance.checkpoint.tables[&table("public.orders")],
            TableCursor::Merged
        );
    }

    #[test]
    fn catch_up_ahead_of_position_waits_for_the_mirror() {
        let mut checkpoint = Checkpoint::new(p(3), [table("public.users")]);
        checkpoint.admit(table("public.orders"), p(8));

        let advance = checkpoint.advance(p(5));
        assert!(advance.merged.is_empty());
        assert_eq!(
            advance.checkpoint.tables[&table("public.orders")],
            TableCursor::CatchUp { cursor: p(8) }
        );

        let advance = advance.checkpoint.advance(p(8));
        assert_eq!(advance.merged, vec![table("public.orders")]);
    }

    #[test]
    fn position_never_moves_backwards() {
        let checkpoint = Checkpoint::new(p(10), [table("public.users")]);

        assert_eq!(checkpoint.advance(p(6)).checkpoint.position, p(10));
    }
}
