//! Concurrency primitives coordinating the workers of a mirror.
//!
//! - [`control`]: the directive channel through which the control API pauses or stops a running
//!   loop. The loop never observes a directive while a batch is being applied.
//! - [`future`]: future adapters, including [`future::reactive`] which reports how a worker ended.
//! - [`signal`]: payload-free signals, used by snapshot workers to wake the running loop once a
//!   table is ready to be merged.

pub mod control;
pub mod future;
pub mod signal;
