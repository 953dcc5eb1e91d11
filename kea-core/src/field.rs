//! Field schema types
//!
//! A [`Field`] is a named, typed column of an attribute table. Fields live in
//! a [`FieldSchema`], an append-only list whose positions are the field
//! indices: index == insertion order == on-disk descriptor order.

use crate::{TableError, TableResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ============================================================================
// FIELD TYPE
// ============================================================================

/// Data type of an attribute table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
}

impl FieldType {
    /// All field types, in tag order.
    pub const ALL: [FieldType; 4] = [
        FieldType::Bool,
        FieldType::Int,
        FieldType::Float,
        FieldType::String,
    ];

    /// Stable on-disk tag.
    pub fn tag(self) -> u8 {
        match self {
            FieldType::Bool => 1,
            FieldType::Int => 2,
            FieldType::Float => 3,
            FieldType::String => 4,
        }
    }

    /// Inverse of [`FieldType::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(FieldType::Bool),
            2 => Some(FieldType::Int),
            3 => Some(FieldType::Float),
            4 => Some(FieldType::String),
            _ => None,
        }
    }

    /// Bytes per row in a fixed-stride column region.
    ///
    /// String columns store an `(offset, length)` pair per row; the bytes
    /// themselves live in a separate blob region.
    pub fn stride(self) -> usize {
        match self {
            FieldType::Bool => 1,
            FieldType::Int => 8,
            FieldType::Float => 8,
            FieldType::String => 16,
        }
    }

    /// The zero value used when a field is registered without a default.
    pub fn zero_value(self) -> FieldValue {
        match self {
            FieldType::Bool => FieldValue::Bool(false),
            FieldType::Int => FieldValue::Int(0),
            FieldType::Float => FieldValue::Float(0.0),
            FieldType::String => FieldValue::String(String::new()),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "Bool",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::String => "String",
        };
        f.write_str(name)
    }
}

// ============================================================================
// FIELD VALUE
// ============================================================================

/// A single cell value.
///
/// Floats compare by bit pattern, so a NaN cell equals the NaN it was
/// written with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Int(a), FieldValue::Int(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::String(a), FieldValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::Int(_) => FieldType::Int,
            FieldValue::Float(_) => FieldType::Float,
            FieldValue::String(_) => FieldType::String,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::String(v)
    }
}

// ============================================================================
// FIELD
// ============================================================================

/// A registered column of an attribute table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub field_type: FieldType,
    /// Global column number, assigned once and never reused.
    pub index: usize,
    /// Free-form classification, e.g. "Red", "PixelCount", "Name".
    pub usage: String,
    pub default: FieldValue,
}

/// Request to register a field; the index is assigned on registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub default: FieldValue,
    pub usage: String,
}

impl FieldSpec {
    pub fn new(
        name: impl Into<String>,
        field_type: FieldType,
        default: impl Into<FieldValue>,
        usage: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type,
            default: default.into(),
            usage: usage.into(),
        }
    }

    /// A spec whose default is the type's zero value.
    pub fn with_type_default(
        name: impl Into<String>,
        field_type: FieldType,
        usage: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type,
            default: field_type.zero_value(),
            usage: usage.into(),
        }
    }
}

// ============================================================================
// FIELD SCHEMA
// ============================================================================

/// Append-only, ordered set of fields with name lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSchema {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
}

impl FieldSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a schema from a persisted descriptor list.
    ///
    /// Rejects lists whose indices do not match their positions, duplicated
    /// names, and defaults of the wrong type.
    pub fn from_fields(fields: Vec<Field>) -> TableResult<Self> {
        let mut schema = Self::new();
        for (position, field) in fields.into_iter().enumerate() {
            if field.index != position {
                return Err(TableError::FieldIndexOutOfRange {
                    index: field.index,
                    field_count: position,
                });
            }
            if schema.by_name.contains_key(&field.name) {
                return Err(TableError::DuplicateFieldName { name: field.name });
            }
            check_type(&field.name, field.field_type, &field.default)?;
            schema.by_name.insert(field.name.clone(), position);
            schema.fields.push(field);
        }
        Ok(schema)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Look up a field by name, failing with `UnknownField`.
    pub fn require(&self, name: &str) -> TableResult<&Field> {
        self.get(name).ok_or_else(|| TableError::UnknownField {
            name: name.to_string(),
        })
    }

    /// Look up a field by index, failing with `FieldIndexOutOfRange`.
    pub fn at(&self, index: usize) -> TableResult<&Field> {
        self.fields
            .get(index)
            .ok_or(TableError::FieldIndexOutOfRange {
                index,
                field_count: self.fields.len(),
            })
    }

    /// Look up a field and check that `value` has its type.
    pub fn require_typed(&self, name: &str, value: &FieldValue) -> TableResult<&Field> {
        let field = self.require(name)?;
        check_type(&field.name, field.field_type, value)?;
        Ok(field)
    }

    pub fn count_of_type(&self, field_type: FieldType) -> usize {
        self.fields
            .iter()
            .filter(|f| f.field_type == field_type)
            .count()
    }

    /// Validate a batch of specs and assign indices, without mutating.
    ///
    /// Duplicates are checked against existing fields and inside the batch.
    pub fn plan(&self, specs: &[FieldSpec]) -> TableResult<Vec<Field>> {
        let mut planned: Vec<Field> = Vec::with_capacity(specs.len());
        for spec in specs {
            if self.contains(&spec.name) || planned.iter().any(|f| f.name == spec.name) {
                return Err(TableError::DuplicateFieldName {
                    name: spec.name.clone(),
                });
            }
            check_type(&spec.name, spec.field_type, &spec.default)?;
            planned.push(Field {
                name: spec.name.clone(),
                field_type: spec.field_type,
                index: self.fields.len() + planned.len(),
                usage: spec.usage.clone(),
                default: spec.default.clone(),
            });
        }
        Ok(planned)
    }

    /// Append fields produced by [`FieldSchema::plan`] on this schema.
    pub fn commit(&mut self, planned: Vec<Field>) {
        for field in planned {
            debug_assert_eq!(field.index, self.fields.len());
            self.by_name.insert(field.name.clone(), field.index);
            self.fields.push(field);
        }
    }
}

/// Fail with `TypeMismatch` unless `value` is of `expected` type.
pub fn check_type(field: &str, expected: FieldType, value: &FieldValue) -> TableResult<()> {
    let got = value.field_type();
    if got != expected {
        return Err(TableError::TypeMismatch {
            field: field.to_string(),
            expected,
            got,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema_with(specs: &[FieldSpec]) -> FieldSchema {
        let mut schema = FieldSchema::new();
        let planned = schema.plan(specs).unwrap();
        schema.commit(planned);
        schema
    }

    #[test]
    fn test_tag_roundtrip() {
        for t in FieldType::ALL {
            assert_eq!(FieldType::from_tag(t.tag()), Some(t));
        }
        assert_eq!(FieldType::from_tag(0), None);
        assert_eq!(FieldType::from_tag(9), None);
    }

    #[test]
    fn test_float_values_compare_by_bits() {
        assert_eq!(FieldValue::Float(f64::NAN), FieldValue::Float(f64::NAN));
        assert_eq!(
            FieldValue::Float(f64::NEG_INFINITY),
            FieldValue::Float(f64::NEG_INFINITY)
        );
        assert_ne!(FieldValue::Float(0.0), FieldValue::Float(-0.0));
        assert_ne!(FieldValue::Int(1), FieldValue::Float(1.0));
    }

    #[test]
    fn test_plan_assigns_sequential_indices() {
        let schema = schema_with(&[
            FieldSpec::new("a", FieldType::Int, 0i64, ""),
            FieldSpec::new("b", FieldType::Bool, false, ""),
        ]);
        let planned = schema
            .plan(&[FieldSpec::new("c", FieldType::String, "x", "Name")])
            .unwrap();
        assert_eq!(planned[0].index, 2);
        assert_eq!(schema.len(), 2);
    }

    #[test]
    fn test_plan_rejects_duplicate_in_batch() {
        let schema = FieldSchema::new();
        let err = schema
            .plan(&[
                FieldSpec::new("a", FieldType::Int, 0i64, ""),
                FieldSpec::new("a", FieldType::Float, 0.0, ""),
            ])
            .unwrap_err();
        assert_eq!(
            err,
            TableError::DuplicateFieldName {
                name: "a".to_string()
            }
        );
    }

    #[test]
    fn test_plan_rejects_duplicate_against_existing() {
        let schema = schema_with(&[FieldSpec::new("a", FieldType::Int, 0i64, "")]);
        let err = schema
            .plan(&[FieldSpec::new("a", FieldType::Int, 1i64, "")])
            .unwrap_err();
        assert!(matches!(err, TableError::DuplicateFieldName { .. }));
    }

    #[test]
    fn test_plan_rejects_mistyped_default() {
        let schema = FieldSchema::new();
        let err = schema
            .plan(&[FieldSpec::new("a", FieldType::Int, "zero", "")])
            .unwrap_err();
        assert_eq!(
            err,
            TableError::TypeMismatch {
                field: "a".to_string(),
                expected: FieldType::Int,
                got: FieldType::String,
            }
        );
    }

    #[test]
    fn test_from_fields_rejects_index_gap() {
        let fields = vec![Field {
            name: "a".to_string(),
            field_type: FieldType::Int,
            index: 1,
            usage: String::new(),
            default: FieldValue::Int(0),
        }];
        assert!(FieldSchema::from_fields(fields).is_err());
    }

    #[test]
    fn test_count_of_type() {
        let schema = schema_with(&[
            FieldSpec::with_type_default("a", FieldType::Int, ""),
            FieldSpec::with_type_default("b", FieldType::Int, ""),
            FieldSpec::with_type_default("c", FieldType::String, ""),
        ]);
        assert_eq!(schema.count_of_type(FieldType::Int), 2);
        assert_eq!(schema.count_of_type(FieldType::String), 1);
        assert_eq!(schema.count_of_type(FieldType::Bool), 0);
    }

    #[test]
    fn test_require_typed() {
        let schema = schema_with(&[FieldSpec::new("a", FieldType::Float, 1.5, "")]);
        assert!(schema.require_typed("a", &FieldValue::Float(2.0)).is_ok());
        assert!(matches!(
            schema.require_typed("a", &FieldValue::Int(2)),
            Err(TableError::TypeMismatch { .. })
        ));
        assert!(matches!(
            schema.require_typed("b", &FieldValue::Float(2.0)),
            Err(TableError::UnknownField { .. })
        ));
    }
}
