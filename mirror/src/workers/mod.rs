//! Workers that move data for mirrors.
//!
//! [`mirror::MirrorWorker`] runs the incremental stream of a mirror, the snapshot workflow copies
//! tables added to it and hands them over to the running loop.

pub mod lifecycle;
pub mod mirror;
pub mod policy;
pub mod pool;
pub mod snapshot;
