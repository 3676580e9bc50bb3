//! Durable state of the control plane.
//!
//! The [`catalog`] holds each mirror's lifecycle state and configuration, the [`checkpoint`] store
//! holds what the running loop and snapshot workers persist. [`both`] has implementations of both.

pub mod both;
pub mod catalog;
pub mod checkpoint;
