//! The control API of the mirror control plane.

mod api;
pub mod peers;
pub mod request;

pub use api::MirrorController;
pub use peers::PeerRegistry;
pub use request::{
    CheckpointSummary, CreateMirrorRequest, FailedTable, MirrorStatusResponse, StateChangeRequest,
    UnregisteredTable,
};
