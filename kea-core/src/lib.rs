//! KEA Core - Attribute Table Types
//!
//! Pure data structures with no I/O. The storage crate depends on this:
//! field schema, cell values, band enums, errors and configuration.

pub mod config;
pub mod enums;
pub mod error;
pub mod field;

pub use config::{KeaConfig, DEFAULT_ATT_CHUNK_SIZE, DEFAULT_IMAGE_BLOCK_SIZE};
pub use enums::{AttributeTableKind, BandDataType, ImageSpec};
pub use error::{ConfigError, ImageError, KeaError, KeaResult, TableError, TableResult};
pub use field::{check_type, Field, FieldSchema, FieldSpec, FieldType, FieldValue};
