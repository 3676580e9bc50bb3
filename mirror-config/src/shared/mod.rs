//! Shared configuration types for mirrors and the control plane.

mod base;
mod control_plane;
mod mirror;
mod table;

pub use base::ValidationError;
pub use control_plane::ControlPlaneConfig;
pub use mirror::MirrorConfig;
pub use table::{TableMapping, TableName};
