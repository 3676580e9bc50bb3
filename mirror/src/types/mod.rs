//! Core data types shared across the control plane.
//!
//! Re-exports source positions, change events and the configuration types mirrors are built from.

mod event;
mod position;

pub use event::*;
pub use position::*;

// Re-exports.
pub use mirror_config::shared::{ControlPlaneConfig, MirrorConfig, TableMapping, TableName};
