use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// A source table name is not in `schema.table` form.
    #[error("table `{0}` must be schema-qualified (`schema.table`)")]
    UnqualifiedTable(String),
    /// A source table appears more than once, or is already tracked by the mirror.
    #[error("source table `{0}` is already tracked by the mirror")]
    DuplicateSourceTable(String),
    /// A destination table is the target of more than one mapping.
    #[error("destination table `{0}` is already the target of another mapping")]
    DuplicateDestinationTable(String),
    /// Removing a tracked table was requested.
    #[error("table `{0}` cannot be removed from a mirror, table removal is not supported")]
    TableRemovalNotSupported(String),
}
