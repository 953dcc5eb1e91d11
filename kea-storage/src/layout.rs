//! Durable key scheme and descriptor records.
//!
//! ```text
//! /HEADER                               ImageHeader (JSON)
//! /BAND{n}/META                         BandMeta (JSON)
//! /BAND{n}/DATA                         PixelRegion (JSON)
//! /BAND{n}/ATT/HEADER/FIELDS            [FieldRecord] (JSON), table marker
//! /BAND{n}/ATT/HEADER/DEFAULTS          field defaults (tagged binary)
//! /BAND{n}/ATT/HEADER/SIZE              SizeMarker (5 x u64 LE)
//! /BAND{n}/ATT/HEADER/CHUNKSIZE         rows per chunk (u64 LE)
//! /BAND{n}/ATT/HEADER/GENERATION        u64 LE
//! /BAND{n}/ATT/DATA/{index}/{chunk}     fixed-stride column chunk
//! /BAND{n}/ATT/STRINGS/{index}/{chunk}  string blob
//! /BAND{n}/ATT/NEIGHBOURS/{chunk}       neighbour lists of one chunk
//! ```
//!
//! Defaults are kept out of the JSON descriptors because JSON has no
//! encoding for NaN or the infinities.

use kea_core::{BandDataType, Field, FieldSchema, FieldType, FieldValue, TableError, TableResult};
use serde::{Deserialize, Serialize};

use crate::container::ContainerError;

/// Format version written into new headers.
pub const FORMAT_VERSION: &str = "kea-1";

pub const HEADER_KEY: &str = "/HEADER";

pub fn band_meta_key(band: u32) -> String {
    format!("/BAND{band}/META")
}

pub fn band_data_key(band: u32) -> String {
    format!("/BAND{band}/DATA")
}

pub fn fields_key(band: u32) -> String {
    format!("/BAND{band}/ATT/HEADER/FIELDS")
}

pub fn defaults_key(band: u32) -> String {
    format!("/BAND{band}/ATT/HEADER/DEFAULTS")
}

pub fn chunk_size_key(band: u32) -> String {
    format!("/BAND{band}/ATT/HEADER/CHUNKSIZE")
}

pub fn size_key(band: u32) -> String {
    format!("/BAND{band}/ATT/HEADER/SIZE")
}

pub fn generation_key(band: u32) -> String {
    format!("/BAND{band}/ATT/HEADER/GENERATION")
}

pub fn chunk_key(band: u32, field_index: usize, chunk: u64) -> String {
    format!("/BAND{band}/ATT/DATA/{field_index}/{chunk}")
}

pub fn blob_key(band: u32, field_index: usize, chunk: u64) -> String {
    format!("/BAND{band}/ATT/STRINGS/{field_index}/{chunk}")
}

pub fn neighbours_key(band: u32, chunk: u64) -> String {
    format!("/BAND{band}/ATT/NEIGHBOURS/{chunk}")
}

// ============================================================================
// IMAGE RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHeader {
    pub version: String,
    pub x_size: u64,
    pub y_size: u64,
    pub num_bands: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandMeta {
    pub data_type: BandDataType,
    pub description: String,
    pub block_size: u32,
    pub att_chunk_size: u64,
}

/// Pixel-data region of a band. Blocks are allocated lazily and read as
/// `fill` until written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRegion {
    pub x_size: u64,
    pub y_size: u64,
    pub block_size: u32,
    pub data_type: BandDataType,
    pub fill: i64,
}

impl PixelRegion {
    /// Number of `(columns, rows)` of blocks covering the band.
    pub fn block_grid(&self) -> (u64, u64) {
        let block = u64::from(self.block_size);
        (self.x_size.div_ceil(block), self.y_size.div_ceil(block))
    }
}

// ============================================================================
// ATTRIBUTE TABLE RECORDS
// ============================================================================

/// On-disk field descriptor. The default lives in the DEFAULTS record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub type_tag: u8,
    pub usage: String,
    pub index: usize,
}

impl From<&Field> for FieldRecord {
    fn from(field: &Field) -> Self {
        Self {
            name: field.name.clone(),
            type_tag: field.field_type.tag(),
            usage: field.usage.clone(),
            index: field.index,
        }
    }
}

impl FieldRecord {
    pub fn into_field(self, default: FieldValue) -> Result<Field, ContainerError> {
        let field_type = FieldType::from_tag(self.type_tag).ok_or_else(|| ContainerError::Corrupt {
            key: "FIELDS".to_string(),
            reason: format!("unknown type tag {} on field '{}'", self.type_tag, self.name),
        })?;
        Ok(Field {
            name: self.name,
            field_type,
            index: self.index,
            usage: self.usage,
            default,
        })
    }
}

pub fn encode_fields(schema: &FieldSchema) -> Vec<FieldRecord> {
    schema.iter().map(FieldRecord::from).collect()
}

/// Join descriptors with their decoded defaults into a schema.
pub fn decode_fields(
    records: Vec<FieldRecord>,
    defaults: Vec<FieldValue>,
) -> TableResult<FieldSchema> {
    if records.len() != defaults.len() {
        return Err(ContainerError::Corrupt {
            key: "DEFAULTS".to_string(),
            reason: format!(
                "{} defaults for {} field descriptors",
                defaults.len(),
                records.len()
            ),
        }
        .into());
    }
    let fields = records
        .into_iter()
        .zip(defaults)
        .map(|(record, default)| record.into_field(default))
        .collect::<Result<Vec<_>, _>>()?;
    FieldSchema::from_fields(fields)
}

/// Encode every field's default in index order.
///
/// Each entry is the type tag byte followed by the value: one byte for
/// Bool, 8 LE bytes for Int and for the bit pattern of a Float, and a u64
/// LE length plus UTF-8 bytes for String.
pub fn encode_defaults(schema: &FieldSchema) -> Vec<u8> {
    let mut out = Vec::new();
    for field in schema.iter() {
        out.push(field.default.field_type().tag());
        match &field.default {
            FieldValue::Bool(v) => out.push(u8::from(*v)),
            FieldValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            FieldValue::Float(v) => out.extend_from_slice(&v.to_bits().to_le_bytes()),
            FieldValue::String(v) => {
                out.extend_from_slice(&(v.len() as u64).to_le_bytes());
                out.extend_from_slice(v.as_bytes());
            }
        }
    }
    out
}

pub fn decode_defaults(key: &str, bytes: &[u8]) -> Result<Vec<FieldValue>, ContainerError> {
    let corrupt = |reason: String| ContainerError::Corrupt {
        key: key.to_string(),
        reason,
    };
    let truncated = || corrupt(format!("truncated record of {} bytes", bytes.len()));

    let mut pos = 0;
    let mut defaults = Vec::new();
    while pos < bytes.len() {
        let tag = bytes[pos];
        pos += 1;
        let value = match FieldType::from_tag(tag) {
            Some(FieldType::Bool) => {
                FieldValue::Bool(take(bytes, &mut pos, 1).ok_or_else(truncated)?[0] != 0)
            }
            Some(FieldType::Int) => {
                FieldValue::Int(take_u64(bytes, &mut pos).ok_or_else(truncated)? as i64)
            }
            Some(FieldType::Float) => {
                FieldValue::Float(f64::from_bits(take_u64(bytes, &mut pos).ok_or_else(truncated)?))
            }
            Some(FieldType::String) => {
                let len = take_u64(bytes, &mut pos).ok_or_else(truncated)?;
                let len = usize::try_from(len)
                    .map_err(|_| corrupt(format!("string length {len} overflows")))?;
                let raw = take(bytes, &mut pos, len).ok_or_else(truncated)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|e| corrupt(format!("invalid UTF-8: {e}")))?;
                FieldValue::String(s.to_string())
            }
            None => return Err(corrupt(format!("unknown type tag {tag}"))),
        };
        defaults.push(value);
    }
    Ok(defaults)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(n)?;
    let out = bytes.get(*pos..end)?;
    *pos = end;
    Some(out)
}

fn take_u64(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let raw: [u8; 8] = take(bytes, pos, 8)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// Row count plus per-type field counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeMarker {
    pub rows: u64,
    pub bool_fields: u64,
    pub int_fields: u64,
    pub float_fields: u64,
    pub string_fields: u64,
}

impl SizeMarker {
    pub const ENCODED_LEN: usize = 40;

    pub fn of(schema: &FieldSchema, rows: u64) -> Self {
        let count = |t| schema.count_of_type(t) as u64;
        Self {
            rows,
            bool_fields: count(FieldType::Bool),
            int_fields: count(FieldType::Int),
            float_fields: count(FieldType::Float),
            string_fields: count(FieldType::String),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        for v in [
            self.rows,
            self.bool_fields,
            self.int_fields,
            self.float_fields,
            self.string_fields,
        ] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    pub fn decode(key: &str, bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(ContainerError::Corrupt {
                key: key.to_string(),
                reason: format!("expected {} bytes, found {}", Self::ENCODED_LEN, bytes.len()),
            });
        }
        let word = |i: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(buf)
        };
        Ok(Self {
            rows: word(0),
            bool_fields: word(1),
            int_fields: word(2),
            float_fields: word(3),
            string_fields: word(4),
        })
    }

    /// Check that the per-type counts agree with a decoded schema.
    pub fn check(&self, schema: &FieldSchema) -> TableResult<()> {
        let expected = Self::of(schema, self.rows);
        if expected != *self {
            return Err(TableError::BackendIOFailure {
                reason: format!(
                    "size marker {:?} disagrees with field descriptors {:?}",
                    self, expected
                ),
            });
        }
        Ok(())
    }
}

pub fn encode_generation(generation: u64) -> [u8; 8] {
    generation.to_le_bytes()
}

pub fn decode_generation(key: &str, bytes: Option<&[u8]>) -> Result<u64, ContainerError> {
    match bytes {
        None => Ok(0),
        Some(bytes) => {
            let buf: [u8; 8] = bytes.try_into().map_err(|_| ContainerError::Corrupt {
                key: key.to_string(),
                reason: format!("expected 8 bytes, found {}", bytes.len()),
            })?;
            Ok(u64::from_le_bytes(buf))
        }
    }
}

/// Rows per chunk of a stored table. Zero is rejected.
pub fn decode_chunk_size(key: &str, bytes: &[u8]) -> Result<u64, ContainerError> {
    let buf: [u8; 8] = bytes.try_into().map_err(|_| ContainerError::Corrupt {
        key: key.to_string(),
        reason: format!("expected 8 bytes, found {}", bytes.len()),
    })?;
    match u64::from_le_bytes(buf) {
        0 => Err(ContainerError::Corrupt {
            key: key.to_string(),
            reason: "chunk size is zero".to_string(),
        }),
        size => Ok(size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kea_core::FieldSpec;

    #[test]
    fn test_keys() {
        assert_eq!(band_meta_key(1), "/BAND1/META");
        assert_eq!(fields_key(2), "/BAND2/ATT/HEADER/FIELDS");
        assert_eq!(chunk_key(3, 4, 5), "/BAND3/ATT/DATA/4/5");
        assert_eq!(blob_key(3, 4, 5), "/BAND3/ATT/STRINGS/4/5");
        assert_eq!(neighbours_key(3, 5), "/BAND3/ATT/NEIGHBOURS/5");
        assert_eq!(defaults_key(1), "/BAND1/ATT/HEADER/DEFAULTS");
    }

    #[test]
    fn test_size_marker_counts() {
        let mut schema = FieldSchema::new();
        let planned = schema
            .plan(&[
                FieldSpec::with_type_default("a", FieldType::Int, ""),
                FieldSpec::with_type_default("b", FieldType::String, ""),
                FieldSpec::with_type_default("c", FieldType::Int, ""),
            ])
            .unwrap();
        schema.commit(planned);

        let marker = SizeMarker::of(&schema, 12);
        assert_eq!(marker.rows, 12);
        assert_eq!(marker.int_fields, 2);
        assert_eq!(marker.string_fields, 1);
        assert_eq!(marker.bool_fields, 0);

        let decoded = SizeMarker::decode("SIZE", &marker.encode()).unwrap();
        assert_eq!(decoded, marker);
        assert!(decoded.check(&schema).is_ok());
        assert!(SizeMarker::decode("SIZE", &[0u8; 7]).is_err());
    }

    #[test]
    fn test_unknown_type_tag_is_corrupt() {
        let record = FieldRecord {
            name: "x".to_string(),
            type_tag: 9,
            usage: String::new(),
            index: 0,
        };
        assert!(matches!(
            record.into_field(FieldValue::Int(0)),
            Err(ContainerError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_defaults_keep_non_finite_floats() {
        let mut schema = FieldSchema::new();
        let planned = schema
            .plan(&[
                FieldSpec::new("nodata", FieldType::Float, f64::NAN, ""),
                FieldSpec::new("hi", FieldType::Float, f64::INFINITY, ""),
                FieldSpec::new("lo", FieldType::Float, f64::NEG_INFINITY, ""),
                FieldSpec::new("flag", FieldType::Bool, true, ""),
                FieldSpec::new("class", FieldType::Int, -7i64, ""),
                FieldSpec::new("label", FieldType::String, "wässer", ""),
            ])
            .unwrap();
        schema.commit(planned);

        let bytes = encode_defaults(&schema);
        let defaults = decode_defaults("DEFAULTS", &bytes).unwrap();
        assert!(defaults[0].as_float().unwrap().is_nan());
        assert_eq!(defaults[1], FieldValue::Float(f64::INFINITY));
        assert_eq!(defaults[2], FieldValue::Float(f64::NEG_INFINITY));

        let decoded = decode_fields(encode_fields(&schema), defaults).unwrap();
        assert_eq!(decoded, schema);

        assert!(decode_defaults("DEFAULTS", &bytes[..bytes.len() - 1]).is_err());
        assert!(decode_fields(encode_fields(&schema), Vec::new()).is_err());
    }

    #[test]
    fn test_chunk_size_rejects_zero() {
        assert_eq!(decode_chunk_size("C", &8u64.to_le_bytes()).unwrap(), 8);
        assert!(decode_chunk_size("C", &0u64.to_le_bytes()).is_err());
        assert!(decode_chunk_size("C", &[1]).is_err());
    }

    #[test]
    fn test_generation_defaults_to_zero() {
        assert_eq!(decode_generation("G", None).unwrap(), 0);
        assert_eq!(decode_generation("G", Some(&encode_generation(7))).unwrap(), 7);
        assert!(decode_generation("G", Some(&[1, 2])).is_err());
    }

    #[test]
    fn test_block_grid_rounds_up() {
        let region = PixelRegion {
            x_size: 300,
            y_size: 256,
            block_size: 256,
            data_type: BandDataType::UInt8,
            fill: 0,
        };
        assert_eq!(region.block_grid(), (2, 1));
    }
}
