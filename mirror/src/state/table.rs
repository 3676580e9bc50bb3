use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::MirrorError;
use crate::types::{ControlPlaneConfig, Position, TableName};
use crate::workers::policy::{RetryDirective, build_error_handling_policy};

/// Describes a failed table snapshot.
///
/// Contains the table that failed, the reason for the failure, an optional solution suggestion and
/// the retry policy to apply.
#[derive(Debug, Clone)]
pub struct TableSnapshotError {
    table: TableName,
    reason: String,
    solution: Option<String>,
    retry_policy: RetryPolicy,
}

impl TableSnapshotError {
    /// Creates a new [`TableSnapshotError`] with a suggested solution.
    pub fn with_solution(
        table: TableName,
        reason: impl ToString,
        solution: impl ToString,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            table,
            reason: reason.to_string(),
            solution: Some(solution.to_string()),
            retry_policy,
        }
    }

    /// Creates a new [`TableSnapshotError`] without a suggested solution.
    pub fn without_solution(
        table: TableName,
        reason: impl ToString,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            table,
            reason: reason.to_string(),
            solution: None,
            retry_policy,
        }
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Converts a [`MirrorError`] raised while snapshotting `table`.
    ///
    /// The retry policy follows the error handling policy of the error: retry-safe errors are
    /// retried after [`ControlPlaneConfig::apply_retry_delay`] once a retry is requested.
    pub fn from_mirror_error(
        config: &ControlPlaneConfig,
        table: TableName,
        error: &MirrorError,
    ) -> Self {
        let policy = build_error_handling_policy(error);
        let retry_policy = match policy.retry_directive() {
            RetryDirective::Timed => {
                RetryPolicy::retry_in(Duration::milliseconds(config.apply_retry_delay_ms as i64))
            }
            RetryDirective::Manual => RetryPolicy::ManualRetry,
            RetryDirective::NoRetry => RetryPolicy::NoRetry,
        };

        match policy.solution() {
            Some(solution) => Self::with_solution(table, error, solution, retry_policy),
            None => Self::without_solution(table, error, retry_policy),
        }
    }
}

/// Defines the retry strategy for a failed table snapshot.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// No retry should be attempted, the system has to be fixed by hand.
    NoRetry,
    /// Retry after it was manually triggered.
    ManualRetry,
    /// Retry once the timestamp passed and a retry was triggered.
    TimedRetry { next_retry: DateTime<Utc> },
}

impl RetryPolicy {
    pub fn retry_in(duration: Duration) -> Self {
        Self::TimedRetry {
            next_retry: Utc::now() + duration,
        }
    }

    /// Returns `true` if a retry may be triggered now.
    pub fn allows_retry(&self) -> bool {
        match self {
            RetryPolicy::NoRetry => false,
            RetryPolicy::ManualRetry => true,
            RetryPolicy::TimedRetry { next_retry } => *next_retry <= Utc::now(),
        }
    }
}

/// Progress of a table through the snapshot and merge workflow.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum TableSyncPhase {
    /// The table was added and its snapshot has not started.
    Pending,
    /// The snapshot was exported at `start` and its rows are being copied.
    ///
    /// The source retains every change of the table after `start` until the table is merged.
    Snapshotting { start: Position },
    /// Every row of the snapshot exported at `start` was copied.
    ///
    /// The running loop admits the table and replays its changes after `start`.
    SnapshotDone { start: Position },
    /// The table's changes flow through the mirror's incremental stream.
    Merged,
    /// The snapshot failed. The table is excluded from batches until a retry succeeds.
    Errored {
        reason: String,
        solution: Option<String>,
        retry_policy: RetryPolicy,
    },
}

impl TableSyncPhase {
    pub fn as_type(&self) -> TableSyncPhaseType {
        self.into()
    }

    /// Returns the snapshot start position, if the snapshot was exported.
    pub fn snapshot_start(&self) -> Option<Position> {
        match self {
            TableSyncPhase::Snapshotting { start } | TableSyncPhase::SnapshotDone { start } => {
                Some(*start)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TableSyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Snapshotting { start } => write!(f, "snapshotting({start})"),
            Self::SnapshotDone { start } => write!(f, "snapshot_done({start})"),
            Self::Merged => write!(f, "merged"),
            Self::Errored { reason, .. } => write!(f, "errored({reason})"),
        }
    }
}

impl From<TableSnapshotError> for TableSyncPhase {
    fn from(value: TableSnapshotError) -> Self {
        Self::Errored {
            reason: value.reason,
            solution: value.solution,
            retry_policy: value.retry_policy,
        }
    }
}

/// A variant of [`TableSyncPhase`] without the data fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TableSyncPhaseType {
    Pending,
    Snapshotting,
    SnapshotDone,
    Merged,
    Errored,
}

impl TableSyncPhaseType {
    /// Returns `true` if the snapshot worker of the table still has work to do.
    pub fn needs_snapshot(&self) -> bool {
        matches!(self, Self::Pending | Self::Snapshotting)
    }

    /// Returns `true` if the table is done with its snapshot, successfully or not.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::SnapshotDone | Self::Merged | Self::Errored)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, Self::Errored)
    }

    pub fn as_static_str(&self) -> &'static str {
        match self {
            TableSyncPhaseType::Pending => "pending",
            TableSyncPhaseType::Snapshotting => "snapshotting",
            TableSyncPhaseType::SnapshotDone => "snapshot_done",
            TableSyncPhaseType::Merged => "merged",
            TableSyncPhaseType::Errored => "errored",
        }
    }
}

impl<'a> From<&'a TableSyncPhase> for TableSyncPhaseType {
    fn from(phase: &'a TableSyncPhase) -> Self {
        match phase {
            TableSyncPhase::Pending => Self::Pending,
            TableSyncPhase::Snapshotting { .. } => Self::Snapshotting,
            TableSyncPhase::SnapshotDone { .. } => Self::SnapshotDone,
            TableSyncPhase::Merged => Self::Merged,
            TableSyncPhase::Errored { .. } => Self::Errored,
        }
    }
}

impl fmt::Display for TableSyncPhaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_static_str())
    }
}
