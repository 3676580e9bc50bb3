//! Configuration types and loading for the mirror control plane.
//!
//! The types in [`shared`] are the single, strictly typed source of truth for mirror and control
//! plane settings. Every type carries explicit defaults and a `validate` method that is run
//! server-side before any configuration is accepted.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
