//! Logging and metrics initialisation shared by control plane binaries and tests.

pub mod metrics;
pub mod tracing;
