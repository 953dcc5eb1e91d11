//! Error types for KEA operations

use crate::FieldType;
use thiserror::Error;

/// Attribute table errors.
///
/// Everything except `BackendIOFailure`, `SchemaConflict` and `LockPoisoned`
/// is a validation error raised before any mutation, so the table is left
/// unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("Field '{name}' is already within the attribute table")]
    DuplicateFieldName { name: String },

    #[error("Field '{name}' is not within the attribute table")]
    UnknownField { name: String },

    #[error("Type mismatch on field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: FieldType,
        got: FieldType,
    },

    #[error("Row {row} is out of range (table has {row_count} rows)")]
    RowIndexOutOfRange { row: u64, row_count: u64 },

    #[error("Invalid row count: {requested}")]
    InvalidRowCount { requested: i64 },

    #[error("Field index {index} is out of range (table has {field_count} fields)")]
    FieldIndexOutOfRange { index: usize, field_count: usize },

    #[error("Backend I/O failure: {reason}")]
    BackendIOFailure { reason: String },

    #[error("Schema conflict on band {band}: expected layout generation {expected}, found {found}")]
    SchemaConflict { band: u32, expected: u64, found: u64 },

    #[error("Attribute table lock poisoned")]
    LockPoisoned,
}

/// Image container errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    #[error("Image was not open")]
    NotOpen,

    #[error("No image at {path}")]
    NotFound { path: String },

    #[error("Band {band} is out of range (image has {num_bands} bands)")]
    BandOutOfRange { band: u32, num_bands: u32 },

    #[error("Band {band} has no attribute table")]
    NoAttributeTable { band: u32 },

    #[error("Corrupt container header at {key}: {reason}")]
    CorruptHeader { key: String, reason: String },

    #[error("Invalid image dimensions {x_size}x{y_size}")]
    InvalidDimensions { x_size: u64, y_size: u64 },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all KEA errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeaError {
    #[error("Attribute table error: {0}")]
    Table(#[from] TableError),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KeaError {
    /// The wrapped table error, if any.
    pub fn as_table_error(&self) -> Option<&TableError> {
        match self {
            KeaError::Table(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for attribute table operations.
pub type TableResult<T> = Result<T, TableError>;

/// Result type alias for KEA operations.
pub type KeaResult<T> = Result<T, KeaError>;

// =============================================================================
// TESTS
// =============================================================================
