use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::shared::{TableMapping, ValidationError};

/// Runtime configuration of a single mirror.
///
/// A running mirror never observes a partially applied [`MirrorConfig`]: edits are staged as a
/// whole new value and swapped in at a resume boundary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MirrorConfig {
    /// Maximum number of change events applied to the destination in one batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Maximum time, in seconds, the running loop waits for a batch to fill.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// Tables replicated by the mirror, in the order they were added.
    ///
    /// This list is append-only for the whole life of a mirror.
    #[serde(default)]
    pub table_mappings: Vec<TableMapping>,
}

impl MirrorConfig {
    pub const DEFAULT_BATCH_SIZE: u32 = 1000;

    pub const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 60;

    pub fn new(table_mappings: Vec<TableMapping>) -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            table_mappings,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    /// Returns the mapping of `source_table`, if the mirror tracks it.
    pub fn mapping_for(&self, source_table: &str) -> Option<&TableMapping> {
        self.table_mappings
            .iter()
            .find(|mapping| mapping.source_table.as_str() == source_table)
    }

    /// Validates mirror configuration settings.
    ///
    /// Ensures the batch size is non-zero and that both source and destination tables are unique
    /// across the mappings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "batch_size".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        let mut source_tables = HashSet::with_capacity(self.table_mappings.len());
        let mut destination_tables = HashSet::with_capacity(self.table_mappings.len());
        for mapping in &self.table_mappings {
            if !source_tables.insert(mapping.source_table.as_str()) {
                return Err(ValidationError::DuplicateSourceTable(
                    mapping.source_table.to_string(),
                ));
            }

            if mapping.destination_table.trim().is_empty() {
                return Err(ValidationError::InvalidFieldValue {
                    field: "table_mappings.destination_table".to_string(),
                    constraint: format!(
                        "must not be empty for source table `{}`",
                        mapping.source_table
                    ),
                });
            }

            if !destination_tables.insert(mapping.destination_table.as_str()) {
                return Err(ValidationError::DuplicateDestinationTable(
                    mapping.destination_table.clone(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

fn default_batch_size() -> u32 {
    MirrorConfig::DEFAULT_BATCH_SIZE
}

fn default_idle_timeout_seconds() -> u64 {
    MirrorConfig::DEFAULT_IDLE_TIMEOUT_SECONDS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(source: &str, destination: &str) -> TableMapping {
        TableMapping::parse(source, destination).unwrap()
    }

    #[test]
    fn defaults_are_applied_when_deserializing() {
        let config: MirrorConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.batch_size, MirrorConfig::DEFAULT_BATCH_SIZE);
        assert_eq!(
            config.idle_timeout_seconds,
            MirrorConfig::DEFAULT_IDLE_TIMEOUT_SECONDS
        );
        assert!(config.table_mappings.is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = MirrorConfig {
            batch_size: 0,
            ..MirrorConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "batch_size"
        ));
    }

    #[test]
    fn duplicate_tables_are_rejected() {
        let config = MirrorConfig::new(vec![
            mapping("public.users", "users"),
            mapping("public.users", "users_copy"),
        ]);
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateSourceTable(
                "public.users".to_string()
            ))
        );

        let config = MirrorConfig::new(vec![
            mapping("public.users", "users"),
            mapping("sales.users", "users"),
        ]);
        assert_eq!(
            config.validate(),
            Err(ValidationError::DuplicateDestinationTable(
                "users".to_string()
            ))
        );
    }
}
