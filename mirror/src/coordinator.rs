//! Validation and staging of configuration edits.
//!
//! An edit is validated as a whole before anything is written. The result is a complete new
//! [`MirrorConfig`] that the control API stages next to the running one, together with the
//! [`TableMappingDelta`] the snapshot workflow onboards.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::MirrorResult;
use crate::types::{MirrorConfig, TableMapping, TableName};
use mirror_config::shared::ValidationError;

/// A table requested by an edit, as received from the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMappingRequest {
    pub source_table: String,
    pub destination_table: String,
}

impl TableMappingRequest {
    pub fn new(source_table: impl Into<String>, destination_table: impl Into<String>) -> Self {
        Self {
            source_table: source_table.into(),
            destination_table: destination_table.into(),
        }
    }
}

/// A configuration edit of a paused mirror.
///
/// Numeric fields are signed so out-of-range values reach validation instead of failing
/// deserialization. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ConfigUpdate {
    pub batch_size: Option<i64>,
    pub idle_timeout_seconds: Option<i64>,
    #[serde(default)]
    pub additional_tables: Vec<TableMappingRequest>,
    /// Tables to stop tracking. Any entry rejects the edit.
    #[serde(default)]
    pub removed_tables: Vec<String>,
    /// Number of syncs after which the mirror pauses itself, `0` for no limit.
    pub number_of_syncs: Option<i64>,
}

/// Tables requested by an edit that the mirror does not track yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableMappingDelta {
    mappings: Vec<TableMapping>,
}

impl TableMappingDelta {
    /// Computes the requested mappings whose source table is not tracked by `tracked`.
    pub fn compute(requested: &[TableMapping], tracked: &MirrorConfig) -> Self {
        let mappings = requested
            .iter()
            .filter(|mapping| tracked.mapping_for(mapping.source_table.as_str()).is_none())
            .cloned()
            .collect();

        Self { mappings }
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableName> {
        self.mappings.iter().map(|mapping| &mapping.source_table)
    }

    pub fn mappings(&self) -> &[TableMapping] {
        &self.mappings
    }
}

/// A validated edit, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedConfig {
    /// The configuration the mirror runs with after its next resume.
    pub config: MirrorConfig,
    pub delta: TableMappingDelta,
    /// New sync limit, if the edit set one.
    pub sync_limit: Option<u64>,
}

/// Validates `update` against `current` and builds the configuration it stages.
///
/// Rejects non-positive batch sizes, negative idle timeouts and sync limits, unqualified tables,
/// tables requested twice or already tracked, and any table removal. Nothing is returned unless
/// the whole edit is valid.
pub fn stage_config_update(
    current: &MirrorConfig,
    update: &ConfigUpdate,
) -> MirrorResult<StagedConfig> {
    if let Some(table) = update.removed_tables.first() {
        return Err(ValidationError::TableRemovalNotSupported(table.clone()).into());
    }

    let mut config = current.clone();

    if let Some(batch_size) = update.batch_size {
        config.batch_size = u32::try_from(batch_size)
            .ok()
            .filter(|batch_size| *batch_size > 0)
            .ok_or_else(|| ValidationError::InvalidFieldValue {
                field: "batch_size".to_string(),
                constraint: format!("must be between 1 and {}, got {batch_size}", u32::MAX),
            })?;
    }

    if let Some(idle_timeout_seconds) = update.idle_timeout_seconds {
        config.idle_timeout_seconds =
            u64::try_from(idle_timeout_seconds).map_err(|_| ValidationError::InvalidFieldValue {
                field: "idle_timeout_seconds".to_string(),
                constraint: format!("must not be negative, got {idle_timeout_seconds}"),
            })?;
    }

    let sync_limit = update
        .number_of_syncs
        .map(|number_of_syncs| {
            u64::try_from(number_of_syncs).map_err(|_| ValidationError::InvalidFieldValue {
                field: "number_of_syncs".to_string(),
                constraint: format!("must not be negative, got {number_of_syncs}"),
            })
        })
        .transpose()?;

    let mut requested = Vec::with_capacity(update.additional_tables.len());
    let mut seen = HashSet::with_capacity(update.additional_tables.len());
    for table in &update.additional_tables {
        let mapping = TableMapping::parse(&table.source_table, &table.destination_table)?;

        if !seen.insert(mapping.source_table.clone())
            || current.mapping_for(mapping.source_table.as_str()).is_some()
        {
            return Err(ValidationError::DuplicateSourceTable(mapping.source_table.to_string()).into());
        }

        requested.push(mapping);
    }

    let delta = TableMappingDelta::compute(&requested, current);
    config.table_mappings.extend(delta.mappings().iter().cloned());
    config.validate()?;

    Ok(StagedConfig {
        config,
        delta,
        sync_limit,
    })
}
