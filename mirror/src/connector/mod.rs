//! The contract every backend of a mirror satisfies.
//!
//! [`Connector`] covers session management, [`Source`] and [`Destination`] the capabilities of each
//! side. [`ConnectorHandle`] owns a session and is the only way the control plane talks to a
//! backend. [`memory`] provides reference in-memory backends.

mod base;
mod handle;
pub mod memory;

pub use base::{Connector, Destination, Source};
pub use handle::{ConnectorHandle, ConnectorRole};
