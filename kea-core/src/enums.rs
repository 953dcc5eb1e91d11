//! Enum types for KEA images and tables

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pixel data type of an image band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandDataType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl BandDataType {
    /// Size of one pixel in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            BandDataType::Int8 | BandDataType::UInt8 => 1,
            BandDataType::Int16 | BandDataType::UInt16 => 2,
            BandDataType::Int32 | BandDataType::UInt32 | BandDataType::Float32 => 4,
            BandDataType::Int64 | BandDataType::UInt64 | BandDataType::Float64 => 8,
        }
    }
}

impl fmt::Display for BandDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BandDataType::Int8 => "int8",
            BandDataType::Int16 => "int16",
            BandDataType::Int32 => "int32",
            BandDataType::Int64 => "int64",
            BandDataType::UInt8 => "uint8",
            BandDataType::UInt16 => "uint16",
            BandDataType::UInt32 => "uint32",
            BandDataType::UInt64 => "uint64",
            BandDataType::Float32 => "float32",
            BandDataType::Float64 => "float64",
        };
        f.write_str(s)
    }
}

/// Backend an attribute table is materialised with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeTableKind {
    /// Fully resident, never durable.
    InMemory,
    /// Backed by a container band, durable on flush.
    File,
}

impl fmt::Display for AttributeTableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeTableKind::InMemory => f.write_str("in-memory"),
            AttributeTableKind::File => f.write_str("file"),
        }
    }
}

/// Shape of a new image container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub x_size: u64,
    pub y_size: u64,
    pub num_bands: u32,
    pub data_type: BandDataType,
    /// Per-band descriptions; missing entries default to "Band N".
    pub band_descriptions: Vec<String>,
}

impl ImageSpec {
    pub fn new(x_size: u64, y_size: u64, num_bands: u32, data_type: BandDataType) -> Self {
        Self {
            x_size,
            y_size,
            num_bands,
            data_type,
            band_descriptions: Vec::new(),
        }
    }

    pub fn with_band_descriptions(mut self, descriptions: Vec<String>) -> Self {
        self.band_descriptions = descriptions;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_sizes() {
        assert_eq!(BandDataType::UInt8.size_bytes(), 1);
        assert_eq!(BandDataType::Int16.size_bytes(), 2);
        assert_eq!(BandDataType::Float32.size_bytes(), 4);
        assert_eq!(BandDataType::Float64.size_bytes(), 8);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(AttributeTableKind::InMemory.to_string(), "in-memory");
        assert_eq!(AttributeTableKind::File.to_string(), "file");
    }
}
