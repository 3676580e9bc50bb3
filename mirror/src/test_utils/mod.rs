//! Utilities for testing mirrors end to end against the memory connectors.
//!
//! [`mirror::TestMirrorEnv`] wires a [`crate::control::MirrorController`] to connectors whose
//! failures can be scripted ([`faulty`]) and to a store that notifies tests when mirrors and tables
//! reach awaited states ([`notifying_store`]).

#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod faulty;
pub mod mirror;
pub mod notify;
pub mod notifying_store;
