//! KEA Storage - Attribute Table Trait and Backends
//!
//! Defines the attribute table abstraction shared by every backend:
//! - [`InMemoryAttributeTable`]: fully resident, never durable
//! - [`FileAttributeTable`]: column chunks in an LMDB container behind a
//!   write-behind cache, durable on flush
//!
//! [`KeaImage`] is the image-band manager that attaches persistent tables to
//! bands of a container.

pub mod container;
pub mod file;
pub mod image;
pub mod layout;
pub mod mem;

pub use container::{Batch, Container, ContainerError};
pub use file::{CacheStats, FileAttributeTable};
pub use image::{Band, KeaImage};
pub use layout::{BandMeta, ImageHeader, PixelRegion};
pub use mem::InMemoryAttributeTable;

use kea_core::{
    AttributeTableKind, Field, FieldSchema, FieldSpec, FieldType, FieldValue, TableError,
    TableResult,
};

/// Rows moved per block by [`copy_table`] and the text export.
const COPY_BLOCK_ROWS: u64 = 1000;

// ============================================================================
// ATTRIBUTE TABLE TRAIT
// ============================================================================

/// A columnar table of typed attributes, one row per raster category.
///
/// Fields are append-only and keep their insertion order; rows are
/// append-only. Every validation error is raised before anything is
/// mutated.
pub trait AttributeTable: Send {
    /// Backend this table is materialised with.
    fn kind(&self) -> AttributeTableKind;

    /// The ordered field list.
    fn schema(&self) -> &FieldSchema;

    /// Number of rows.
    fn row_count(&self) -> u64;

    /// Register a batch of fields atomically.
    ///
    /// Existing rows read as each new field's default.
    fn add_fields(&mut self, specs: &[FieldSpec]) -> TableResult<Vec<Field>>;

    /// Append `count` rows carrying every field's default.
    fn add_rows(&mut self, count: i64) -> TableResult<()>;

    /// Read one cell.
    fn get_value(&self, row: u64, field: &str) -> TableResult<FieldValue>;

    /// Write one cell.
    fn set_value(&mut self, row: u64, field: &str, value: FieldValue) -> TableResult<()>;

    /// Neighbour lists of `len` consecutive rows starting at `start`.
    ///
    /// A row whose neighbours were never set has an empty list.
    fn get_neighbours(&self, start: u64, len: u64) -> TableResult<Vec<Vec<u64>>>;

    /// Replace the neighbour lists of consecutive rows starting at `start`.
    ///
    /// The range is checked before the first write. Row ids inside a list
    /// are stored as given.
    fn set_neighbours(&mut self, start: u64, neighbours: &[Vec<u64>]) -> TableResult<()>;

    /// Make every change so far durable. Tables that are never durable
    /// have nothing to do.
    fn flush(&mut self) -> TableResult<()> {
        Ok(())
    }

    /// Read `len` consecutive cells of one field starting at `start`.
    fn get_values(&self, start: u64, len: u64, field: &str) -> TableResult<Vec<FieldValue>> {
        self.schema().require(field)?;
        check_range(start, len, self.row_count())?;
        (start..start + len)
            .map(|row| self.get_value(row, field))
            .collect()
    }

    /// Write consecutive cells of one field starting at `start`.
    ///
    /// The range and every value's type are checked before the first write.
    fn set_values(&mut self, start: u64, values: &[FieldValue], field: &str) -> TableResult<()> {
        check_batch(self.schema(), self.row_count(), start, values, field)?;
        for (row, value) in (start..).zip(values) {
            self.set_value(row, field, value.clone())?;
        }
        Ok(())
    }

    /// Set every row of one field to `value`.
    fn fill_column(&mut self, field: &str, value: FieldValue) -> TableResult<()> {
        self.schema().require_typed(field, &value)?;
        let rows = self.row_count();
        let mut start = 0;
        while start < rows {
            let len = COPY_BLOCK_ROWS.min(rows - start);
            let block = vec![value.clone(); len as usize];
            self.set_values(start, &block, field)?;
            start += len;
        }
        Ok(())
    }

    // === Provided accessors ===

    /// Register a single field.
    fn add_field(
        &mut self,
        name: &str,
        field_type: FieldType,
        default: FieldValue,
        usage: &str,
    ) -> TableResult<Field> {
        let spec = FieldSpec {
            name: name.to_string(),
            field_type,
            default,
            usage: usage.to_string(),
        };
        self.add_fields(std::slice::from_ref(&spec))?
            .pop()
            .ok_or(TableError::UnknownField { name: spec.name })
    }

    /// All fields, ordered by index.
    fn fields(&self) -> Vec<Field> {
        self.schema().fields().to_vec()
    }

    fn field(&self, name: &str) -> TableResult<Field> {
        self.schema().require(name).cloned()
    }

    fn field_at(&self, index: usize) -> TableResult<Field> {
        self.schema().at(index).cloned()
    }

    fn has_field(&self, name: &str) -> bool {
        self.schema().contains(name)
    }

    fn field_names(&self) -> Vec<String> {
        self.schema().iter().map(|f| f.name.clone()).collect()
    }

    fn field_count(&self) -> usize {
        self.schema().len()
    }

    fn count_of_type(&self, field_type: FieldType) -> usize {
        self.schema().count_of_type(field_type)
    }

    /// Every field's value at `row`, in schema order.
    fn get_row(&self, row: u64) -> TableResult<Vec<FieldValue>> {
        check_row(row, self.row_count())?;
        self.schema()
            .iter()
            .map(|f| self.get_value(row, &f.name))
            .collect()
    }

    /// Write the table as tab-separated text: a header of `FID` and the
    /// field names, then one line per row.
    fn write_text(&self, out: &mut dyn std::io::Write) -> TableResult<()> {
        use std::io::Write;

        let io = |e: std::io::Error| TableError::BackendIOFailure {
            reason: e.to_string(),
        };

        let mut header = String::from("FID");
        for name in self.field_names() {
            header.push('\t');
            header.push_str(&name);
        }
        writeln!(out, "{header}").map_err(io)?;

        let rows = self.row_count();
        let mut start = 0;
        while start < rows {
            let len = COPY_BLOCK_ROWS.min(rows - start);
            let columns = self
                .schema()
                .iter()
                .map(|f| self.get_values(start, len, &f.name))
                .collect::<TableResult<Vec<_>>>()?;
            for offset in 0..len as usize {
                let mut line = (start + offset as u64).to_string();
                for column in &columns {
                    line.push('\t');
                    line.push_str(&column[offset].to_string());
                }
                writeln!(out, "{line}").map_err(io)?;
            }
            start += len;
        }
        Ok(())
    }
}

// ============================================================================
// VALIDATION HELPERS
// ============================================================================

/// Fail with `RowIndexOutOfRange` unless `row < row_count`.
pub fn check_row(row: u64, row_count: u64) -> TableResult<()> {
    if row >= row_count {
        return Err(TableError::RowIndexOutOfRange { row, row_count });
    }
    Ok(())
}

/// Fail unless `[start, start + len)` lies within the table.
pub fn check_range(start: u64, len: u64, row_count: u64) -> TableResult<()> {
    let end = start.checked_add(len).ok_or(TableError::RowIndexOutOfRange {
        row: u64::MAX,
        row_count,
    })?;
    if end > row_count {
        return Err(TableError::RowIndexOutOfRange {
            row: end - 1,
            row_count,
        });
    }
    Ok(())
}

/// Validate a bulk write: known field, range in bounds, all values typed.
pub fn check_batch<'a>(
    schema: &'a FieldSchema,
    row_count: u64,
    start: u64,
    values: &[FieldValue],
    field: &str,
) -> TableResult<&'a Field> {
    let target = schema.require(field)?;
    check_range(start, values.len() as u64, row_count)?;
    for value in values {
        kea_core::check_type(&target.name, target.field_type, value)?;
    }
    Ok(target)
}

/// Validate a requested row growth and return the new row count.
pub fn grown_row_count(row_count: u64, count: i64) -> TableResult<u64> {
    let add = u64::try_from(count).map_err(|_| TableError::InvalidRowCount { requested: count })?;
    row_count
        .checked_add(add)
        .ok_or(TableError::InvalidRowCount { requested: count })
}

// ============================================================================
// TABLE COPY
// ============================================================================

/// Copy the schema, every row and the neighbour lists of `from` into `to`.
///
/// Fields missing in `to` are added with their source definition; a field
/// present in both must have the same type. `to` grows to at least as many
/// rows as `from`.
pub fn copy_table(from: &dyn AttributeTable, to: &mut dyn AttributeTable) -> TableResult<()> {
    let mut missing = Vec::new();
    for field in from.schema().iter() {
        match to.schema().get(&field.name) {
            Some(existing) if existing.field_type != field.field_type => {
                return Err(TableError::TypeMismatch {
                    field: field.name.clone(),
                    expected: existing.field_type,
                    got: field.field_type,
                });
            }
            Some(_) => {}
            None => missing.push(FieldSpec {
                name: field.name.clone(),
                field_type: field.field_type,
                default: field.default.clone(),
                usage: field.usage.clone(),
            }),
        }
    }
    if !missing.is_empty() {
        to.add_fields(&missing)?;
    }

    let rows = from.row_count();
    if to.row_count() < rows {
        let grow = rows - to.row_count();
        let grow = i64::try_from(grow).map_err(|_| TableError::InvalidRowCount { requested: i64::MAX })?;
        to.add_rows(grow)?;
    }

    for field in from.schema().iter() {
        let mut start = 0;
        while start < rows {
            let len = COPY_BLOCK_ROWS.min(rows - start);
            let values = from.get_values(start, len, &field.name)?;
            to.set_values(start, &values, &field.name)?;
            start += len;
        }
    }

    let mut start = 0;
    while start < rows {
        let len = COPY_BLOCK_ROWS.min(rows - start);
        let lists = from.get_neighbours(start, len)?;
        to.set_neighbours(start, &lists)?;
        start += len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_range() {
        assert!(check_range(0, 0, 0).is_ok());
        assert!(check_range(0, 5, 5).is_ok());
        assert_eq!(
            check_range(3, 3, 5),
            Err(TableError::RowIndexOutOfRange {
                row: 5,
                row_count: 5
            })
        );
        assert!(check_range(u64::MAX, 2, 5).is_err());
    }

    #[test]
    fn test_grown_row_count() {
        assert_eq!(grown_row_count(5, 0), Ok(5));
        assert_eq!(grown_row_count(5, 3), Ok(8));
        assert_eq!(
            grown_row_count(5, -1),
            Err(TableError::InvalidRowCount { requested: -1 })
        );
        assert!(grown_row_count(u64::MAX, 1).is_err());
    }

    #[test]
    fn test_copy_table_between_memory_tables() {
        let mut source = InMemoryAttributeTable::new();
        source
            .add_field("class", FieldType::Int, FieldValue::Int(0), "PixelCount")
            .unwrap();
        source
            .add_field("name", FieldType::String, FieldValue::from(""), "Name")
            .unwrap();
        source.add_rows(3).unwrap();
        source.set_value(1, "class", FieldValue::Int(4)).unwrap();
        source.set_value(2, "name", FieldValue::from("water")).unwrap();
        source.set_neighbours(1, &[vec![0, 2], vec![1]]).unwrap();

        let mut target = InMemoryAttributeTable::new();
        target
            .add_field("name", FieldType::String, FieldValue::from("?"), "Name")
            .unwrap();
        copy_table(&source, &mut target).unwrap();

        assert_eq!(target.row_count(), 3);
        assert_eq!(target.field_names(), vec!["name", "class"]);
        assert_eq!(target.get_value(1, "class").unwrap(), FieldValue::Int(4));
        assert_eq!(target.get_value(2, "name").unwrap(), FieldValue::from("water"));
        assert_eq!(target.get_value(0, "name").unwrap(), FieldValue::from(""));
        assert_eq!(
            target.get_neighbours(0, 3).unwrap(),
            vec![Vec::new(), vec![0, 2], vec![1]]
        );
    }

    #[test]
    fn test_copy_table_type_clash() {
        let mut source = InMemoryAttributeTable::new();
        source
            .add_field("v", FieldType::Int, FieldValue::Int(0), "")
            .unwrap();
        let mut target = InMemoryAttributeTable::new();
        target
            .add_field("v", FieldType::Float, FieldValue::Float(0.0), "")
            .unwrap();
        assert!(matches!(
            copy_table(&source, &mut target),
            Err(TableError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_write_text() {
        let mut table = InMemoryAttributeTable::new();
        table
            .add_field("class", FieldType::Int, FieldValue::Int(0), "")
            .unwrap();
        table
            .add_field("forest", FieldType::Bool, FieldValue::Bool(false), "")
            .unwrap();
        table.add_rows(2).unwrap();
        table.set_value(1, "forest", FieldValue::Bool(true)).unwrap();

        let mut out = Vec::new();
        table.write_text(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "FID\tclass\tforest\n0\t0\tfalse\n1\t0\ttrue\n");
    }
}
