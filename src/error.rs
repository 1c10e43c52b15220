use thiserror::Error;

use crate::store::StoreError;

/// Failures that abort an import call before any row is classified.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Unsupported file type: {extension}. Supported: {supported}")]
    UnsupportedFormat {
        extension: String,
        supported: String,
    },
    #[error("Malformed {format} input: {detail}")]
    MalformedInput { format: String, detail: String },
    #[error("The {format} source is empty or contains no data rows")]
    EmptySource { format: String },
    #[error("Invalid table name '{0}'")]
    InvalidTableName(String),
    #[error("An attribution value is required for every import")]
    MissingAttribution,
    #[error("Schema preparation for '{table}' failed: {source}")]
    Schema {
        table: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid sanitizer pattern '{label}': {source}")]
    Pattern {
        label: String,
        #[source]
        source: regex::Error,
    },
    #[error("batch_size must be greater than zero")]
    ZeroBatchSize,
    #[error("max_value_length must be greater than zero")]
    ZeroValueLength,
}

/// A row that could not be classified; it is reported and left unwritten.
#[derive(Debug, Error)]
#[error("Row {row}: identity lookup failed: {source}")]
pub struct RowProcessingError {
    pub row: usize,
    #[source]
    pub source: StoreError,
}
