use serde::{Deserialize, Serialize};
use std::fmt;

use crate::shared::ValidationError;

/// A schema-qualified source table name such as `public.orders`.
///
/// The name is stored exactly as given. Construction through [`TableName::parse`] guarantees that
/// both the schema and the table part are non-empty.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TableName(String);

impl TableName {
    /// Parses a `schema.table` name.
    pub fn parse(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        let Some((schema, table)) = name.split_once('.') else {
            return Err(ValidationError::UnqualifiedTable(name));
        };

        if schema.trim().is_empty() || table.trim().is_empty() || table.contains('.') {
            return Err(ValidationError::UnqualifiedTable(name));
        }

        Ok(Self(name))
    }

    pub fn schema(&self) -> &str {
        self.0.split_once('.').map(|(schema, _)| schema).unwrap_or("")
    }

    pub fn table(&self) -> &str {
        self.0.split_once('.').map(|(_, table)| table).unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TableName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TableName> for String {
    fn from(value: TableName) -> Self {
        value.0
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps one source table onto the destination table receiving its rows and changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table: TableName,
    pub destination_table: String,
}

impl TableMapping {
    pub fn new(source_table: TableName, destination_table: impl Into<String>) -> Self {
        Self {
            source_table,
            destination_table: destination_table.into(),
        }
    }

    /// Builds a mapping from raw names, validating the source table qualification.
    pub fn parse(
        source_table: impl Into<String>,
        destination_table: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Ok(Self::new(
            TableName::parse(source_table)?,
            destination_table,
        ))
    }
}
