//! State tracked for every mirror.
//!
//! - [`mirror`]: the lifecycle state machine and its legal transitions.
//! - [`table`]: per-table snapshot progress and retry policies.
//! - [`checkpoint`]: the checkpoint advanced by the running loop, including the catch-up cursors of
//!   snapshotted tables, and the record persisted in the metadata store.

pub mod checkpoint;
pub mod mirror;
pub mod table;
