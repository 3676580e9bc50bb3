//! Metric names and labels emitted by the control plane.
//!
//! Values are recorded through the `metrics` facade. Installing a recorder, for example the
//! Prometheus exporter in `mirror-telemetry`, is left to the embedding process.

/// Label for the mirror name in metrics.
pub const MIRROR_NAME_LABEL: &str = "mirror_name";

/// Label for the source table name in metrics.
pub const TABLE_NAME_LABEL: &str = "table_name";

/// Label for the error kind in metrics.
pub const ERROR_KIND_LABEL: &str = "error_kind";

/// Label for the state a mirror transitioned into.
pub const STATE_LABEL: &str = "state";

/// Label for the peer side, `source` or `destination`.
pub const PEER_LABEL: &str = "peer";

// Running loop metrics

/// Counter for batches applied to the destination.
pub const MIRROR_BATCHES_APPLIED_TOTAL: &str = "mirror_batches_applied_total";

/// Counter for change events applied to the destination.
pub const MIRROR_EVENTS_APPLIED_TOTAL: &str = "mirror_events_applied_total";

/// Counter for failed attempts to apply a batch.
pub const MIRROR_APPLY_FAILURES_TOTAL: &str = "mirror_apply_failures_total";

/// Gauge for the last durably committed source position.
pub const MIRROR_CHECKPOINT_POSITION: &str = "mirror_checkpoint_position";

// Snapshot metrics

/// Counter for table snapshots that completed.
pub const MIRROR_SNAPSHOTS_COMPLETED_TOTAL: &str = "mirror_snapshots_completed_total";

/// Counter for table snapshots that failed.
pub const MIRROR_SNAPSHOT_FAILURES_TOTAL: &str = "mirror_snapshot_failures_total";

// Lifecycle metrics

/// Counter for persisted mirror state transitions.
pub const MIRROR_STATE_TRANSITIONS_TOTAL: &str = "mirror_state_transitions_total";

/// Counter for peer resources a dropped mirror could not release.
pub const MIRROR_RELEASE_FAILURES_TOTAL: &str = "mirror_release_failures_total";
