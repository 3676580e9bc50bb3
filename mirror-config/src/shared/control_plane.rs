use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Config;
use crate::shared::ValidationError;

/// Settings shared by every mirror managed by one control plane instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ControlPlaneConfig {
    /// Consecutive failed attempts to apply the same batch before the mirror enters `ERROR`.
    #[serde(default = "default_max_apply_attempts")]
    pub max_apply_attempts: u32,
    /// Delay in milliseconds between two attempts of the same batch.
    #[serde(default = "default_apply_retry_delay_ms")]
    pub apply_retry_delay_ms: u64,
    /// Maximum number of table snapshots copying at the same time, per mirror.
    #[serde(default = "default_max_snapshot_workers")]
    pub max_snapshot_workers: u16,
    /// Number of rows written to the destination per snapshot write.
    #[serde(default = "default_snapshot_batch_size")]
    pub snapshot_batch_size: usize,
    /// Interval in milliseconds at which the running loop polls the source while a batch fills.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ControlPlaneConfig {
    pub const DEFAULT_MAX_APPLY_ATTEMPTS: u32 = 5;

    pub const DEFAULT_APPLY_RETRY_DELAY_MS: u64 = 1000;

    pub const DEFAULT_MAX_SNAPSHOT_WORKERS: u16 = 4;

    pub const DEFAULT_SNAPSHOT_BATCH_SIZE: usize = 10_000;

    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    pub fn apply_retry_delay(&self) -> Duration {
        Duration::from_millis(self.apply_retry_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validates control plane settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_apply_attempts == 0 {
            return Err(zero_field("max_apply_attempts"));
        }

        if self.max_snapshot_workers == 0 {
            return Err(zero_field("max_snapshot_workers"));
        }

        if self.snapshot_batch_size == 0 {
            return Err(zero_field("snapshot_batch_size"));
        }

        if self.poll_interval_ms == 0 {
            return Err(zero_field("poll_interval_ms"));
        }

        Ok(())
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            max_apply_attempts: default_max_apply_attempts(),
            apply_retry_delay_ms: default_apply_retry_delay_ms(),
            max_snapshot_workers: default_max_snapshot_workers(),
            snapshot_batch_size: default_snapshot_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config for ControlPlaneConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

fn zero_field(field: &str) -> ValidationError {
    ValidationError::InvalidFieldValue {
        field: field.to_string(),
        constraint: "must be greater than 0".to_string(),
    }
}

fn default_max_apply_attempts() -> u32 {
    ControlPlaneConfig::DEFAULT_MAX_APPLY_ATTEMPTS
}

fn default_apply_retry_delay_ms() -> u64 {
    ControlPlaneConfig::DEFAULT_APPLY_RETRY_DELAY_MS
}

fn default_max_snapshot_workers() -> u16 {
    ControlPlaneConfig::DEFAULT_MAX_SNAPSHOT_WORKERS
}

fn default_snapshot_batch_size() -> usize {
    ControlPlaneConfig::DEFAULT_SNAPSHOT_BATCH_SIZE
}

fn default_poll_interval_ms() -> u64 {
    ControlPlaneConfig::DEFAULT_POLL_INTERVAL_MS
}
