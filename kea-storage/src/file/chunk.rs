//! Column chunk codec.
//!
//! A chunk holds up to `chunk_size` consecutive rows of one field. Bool, Int
//! and Float chunks encode as a single fixed-stride little-endian region.
//! String chunks encode as a region of `(offset: u64, length: u64)` pairs
//! plus a blob holding the concatenated UTF-8 bytes.

use kea_core::{FieldType, FieldValue};

use crate::container::ContainerError;

/// Typed cells of one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    String(Vec<String>),
}

/// Encoded form of a chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub region: Vec<u8>,
    pub blob: Option<Vec<u8>>,
}

impl ColumnData {
    /// A chunk of `len` copies of `value`.
    pub fn filled(value: &FieldValue, len: usize) -> Self {
        match value {
            FieldValue::Bool(v) => ColumnData::Bool(vec![*v; len]),
            FieldValue::Int(v) => ColumnData::Int(vec![*v; len]),
            FieldValue::Float(v) => ColumnData::Float(vec![*v; len]),
            FieldValue::String(v) => ColumnData::String(vec![v.clone(); len]),
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            ColumnData::Bool(_) => FieldType::Bool,
            ColumnData::Int(_) => FieldType::Int,
            ColumnData::Float(_) => FieldType::Float,
            ColumnData::String(_) => FieldType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::String(v) => v.len(),
        }
    }

    /// Approximate resident size, used for flush thresholds.
    pub fn size_bytes(&self) -> usize {
        match self {
            ColumnData::String(v) => {
                v.len() * FieldType::String.stride() + v.iter().map(String::len).sum::<usize>()
            }
            other => other.len() * other.field_type().stride(),
        }
    }

    /// Value at `offset`. Callers check bounds.
    pub fn get(&self, offset: usize) -> FieldValue {
        match self {
            ColumnData::Bool(v) => FieldValue::Bool(v[offset]),
            ColumnData::Int(v) => FieldValue::Int(v[offset]),
            ColumnData::Float(v) => FieldValue::Float(v[offset]),
            ColumnData::String(v) => FieldValue::String(v[offset].clone()),
        }
    }

    /// Store `value` at `offset`. Callers check bounds and type; a value of
    /// another type is ignored.
    pub fn set(&mut self, offset: usize, value: FieldValue) {
        match (self, value) {
            (ColumnData::Bool(v), FieldValue::Bool(x)) => v[offset] = x,
            (ColumnData::Int(v), FieldValue::Int(x)) => v[offset] = x,
            (ColumnData::Float(v), FieldValue::Float(x)) => v[offset] = x,
            (ColumnData::String(v), FieldValue::String(x)) => v[offset] = x,
            _ => debug_assert!(false, "chunk type checked by caller"),
        }
    }

    /// Extend to `len` rows with `default`. Never shrinks.
    pub fn pad_to(&mut self, len: usize, default: &FieldValue) {
        if self.len() >= len {
            return;
        }
        match (self, default) {
            (ColumnData::Bool(v), FieldValue::Bool(d)) => v.resize(len, *d),
            (ColumnData::Int(v), FieldValue::Int(d)) => v.resize(len, *d),
            (ColumnData::Float(v), FieldValue::Float(d)) => v.resize(len, *d),
            (ColumnData::String(v), FieldValue::String(d)) => v.resize(len, d.clone()),
            _ => debug_assert!(false, "default type checked at registration"),
        }
    }

    pub fn encode(&self) -> EncodedChunk {
        match self {
            ColumnData::Bool(v) => EncodedChunk {
                region: v.iter().map(|&b| u8::from(b)).collect(),
                blob: None,
            },
            ColumnData::Int(v) => EncodedChunk {
                region: v.iter().flat_map(|x| x.to_le_bytes()).collect(),
                blob: None,
            },
            ColumnData::Float(v) => EncodedChunk {
                region: v.iter().flat_map(|x| x.to_le_bytes()).collect(),
                blob: None,
            },
            ColumnData::String(v) => {
                let mut region = Vec::with_capacity(v.len() * FieldType::String.stride());
                let mut blob = Vec::new();
                for s in v {
                    region.extend_from_slice(&(blob.len() as u64).to_le_bytes());
                    region.extend_from_slice(&(s.len() as u64).to_le_bytes());
                    blob.extend_from_slice(s.as_bytes());
                }
                EncodedChunk {
                    region,
                    blob: Some(blob),
                }
            }
        }
    }

    /// Decode a stored chunk of `field_type`.
    ///
    /// `key` names the region for error reporting.
    pub fn decode(
        key: &str,
        field_type: FieldType,
        region: &[u8],
        blob: Option<&[u8]>,
    ) -> Result<Self, ContainerError> {
        let corrupt = |reason: String| ContainerError::Corrupt {
            key: key.to_string(),
            reason,
        };
        let stride = field_type.stride();
        if region.len() % stride != 0 {
            return Err(corrupt(format!(
                "region length {} is not a multiple of stride {}",
                region.len(),
                stride
            )));
        }

        let words = || {
            region.chunks_exact(8).map(|w| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(w);
                buf
            })
        };

        match field_type {
            FieldType::Bool => Ok(ColumnData::Bool(region.iter().map(|&b| b != 0).collect())),
            FieldType::Int => Ok(ColumnData::Int(words().map(i64::from_le_bytes).collect())),
            FieldType::Float => Ok(ColumnData::Float(words().map(f64::from_le_bytes).collect())),
            FieldType::String => {
                let blob = blob.unwrap_or(&[]);
                let mut values = Vec::with_capacity(region.len() / stride);
                let mut pairs = words().map(u64::from_le_bytes);
                while let (Some(offset), Some(len)) = (pairs.next(), pairs.next()) {
                    let start = usize::try_from(offset)
                        .map_err(|_| corrupt(format!("string offset {offset} overflows")))?;
                    let end = usize::try_from(len)
                        .ok()
                        .and_then(|len| start.checked_add(len))
                        .filter(|&end| end <= blob.len())
                        .ok_or_else(|| {
                            corrupt(format!(
                                "string ({offset}, {len}) exceeds blob of {} bytes",
                                blob.len()
                            ))
                        })?;
                    let s = std::str::from_utf8(&blob[start..end])
                        .map_err(|e| corrupt(format!("invalid UTF-8: {e}")))?;
                    values.push(s.to_string());
                }
                Ok(ColumnData::String(values))
            }
        }
    }
}
