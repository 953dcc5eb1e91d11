//! In-memory attribute table.

use kea_core::{AttributeTableKind, Field, FieldSchema, FieldSpec, FieldValue, TableResult};

use crate::file::chunk::ColumnData;
use crate::{check_batch, check_range, check_row, grown_row_count, AttributeTable};

/// Fully resident table. Each field is one typed column holding every row.
///
/// Never durable; export it with [`crate::KeaImage::set_attribute_table`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryAttributeTable {
    schema: FieldSchema,
    columns: Vec<ColumnData>,
    neighbours: Vec<Vec<u64>>,
    row_count: u64,
}

impl InMemoryAttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table with `rows` rows and no fields.
    pub fn with_rows(rows: u64) -> Self {
        Self {
            neighbours: vec![Vec::new(); rows as usize],
            row_count: rows,
            ..Self::default()
        }
    }

    fn column(&self, field: &str) -> TableResult<&ColumnData> {
        let field = self.schema.require(field)?;
        Ok(&self.columns[field.index])
    }
}

impl AttributeTable for InMemoryAttributeTable {
    fn kind(&self) -> AttributeTableKind {
        AttributeTableKind::InMemory
    }

    fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }

    fn add_fields(&mut self, specs: &[FieldSpec]) -> TableResult<Vec<Field>> {
        let planned = self.schema.plan(specs)?;
        let rows = self.row_count as usize;
        for field in &planned {
            self.columns.push(ColumnData::filled(&field.default, rows));
        }
        self.schema.commit(planned.clone());
        Ok(planned)
    }

    fn add_rows(&mut self, count: i64) -> TableResult<()> {
        let rows = grown_row_count(self.row_count, count)?;
        if rows == self.row_count {
            return Ok(());
        }
        for (field, column) in self.schema.iter().zip(self.columns.iter_mut()) {
            column.pad_to(rows as usize, &field.default);
        }
        self.neighbours.resize(rows as usize, Vec::new());
        self.row_count = rows;
        Ok(())
    }

    fn get_value(&self, row: u64, field: &str) -> TableResult<FieldValue> {
        let column = self.column(field)?;
        check_row(row, self.row_count)?;
        Ok(column.get(row as usize))
    }

    fn set_value(&mut self, row: u64, field: &str, value: FieldValue) -> TableResult<()> {
        let index = self.schema.require_typed(field, &value)?.index;
        check_row(row, self.row_count)?;
        self.columns[index].set(row as usize, value);
        Ok(())
    }

    fn get_neighbours(&self, start: u64, len: u64) -> TableResult<Vec<Vec<u64>>> {
        check_range(start, len, self.row_count)?;
        Ok(self.neighbours[start as usize..(start + len) as usize].to_vec())
    }

    fn set_neighbours(&mut self, start: u64, neighbours: &[Vec<u64>]) -> TableResult<()> {
        check_range(start, neighbours.len() as u64, self.row_count)?;
        let start = start as usize;
        self.neighbours[start..start + neighbours.len()].clone_from_slice(neighbours);
        Ok(())
    }

    fn get_values(&self, start: u64, len: u64, field: &str) -> TableResult<Vec<FieldValue>> {
        let column = self.column(field)?;
        check_range(start, len, self.row_count)?;
        Ok((start as usize..(start + len) as usize)
            .map(|row| column.get(row))
            .collect())
    }

    fn set_values(&mut self, start: u64, values: &[FieldValue], field: &str) -> TableResult<()> {
        let index = check_batch(&self.schema, self.row_count, start, values, field)?.index;
        let column = &mut self.columns[index];
        for (row, value) in (start as usize..).zip(values) {
            column.set(row, value.clone());
        }
        Ok(())
    }

    fn fill_column(&mut self, field: &str, value: FieldValue) -> TableResult<()> {
        let index = self.schema.require_typed(field, &value)?.index;
        self.columns[index] = ColumnData::filled(&value, self.row_count as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kea_core::{FieldType, TableError};

    fn class_table() -> InMemoryAttributeTable {
        let mut table = InMemoryAttributeTable::new();
        table
            .add_field("class", FieldType::Int, FieldValue::Int(0), "")
            .unwrap();
        table
    }

    #[test]
    fn test_class_scenario() {
        let mut table = class_table();
        table.add_rows(5).unwrap();
        table.set_value(2, "class", FieldValue::Int(7)).unwrap();

        assert_eq!(table.get_value(2, "class").unwrap(), FieldValue::Int(7));
        assert_eq!(table.get_value(0, "class").unwrap(), FieldValue::Int(0));
        assert_eq!(table.row_count(), 5);
        assert_eq!(table.kind(), AttributeTableKind::InMemory);
    }

    #[test]
    fn test_add_field_backfills_existing_rows() {
        let mut table = class_table();
        table.add_rows(4).unwrap();
        table
            .add_field("name", FieldType::String, FieldValue::from("unnamed"), "Name")
            .unwrap();
        assert_eq!(table.column("name").unwrap().len(), 4);
        assert_eq!(
            table.get_value(3, "name").unwrap(),
            FieldValue::from("unnamed")
        );
    }

    #[test]
    fn test_errors_leave_table_unchanged() {
        let mut table = class_table();
        table.add_rows(2).unwrap();

        assert_eq!(
            table.set_value(2, "class", FieldValue::Int(1)),
            Err(TableError::RowIndexOutOfRange {
                row: 2,
                row_count: 2
            })
        );
        assert!(matches!(
            table.set_value(0, "class", FieldValue::Float(1.0)),
            Err(TableError::TypeMismatch { .. })
        ));
        assert!(matches!(
            table.get_value(0, "missing"),
            Err(TableError::UnknownField { .. })
        ));
        assert_eq!(
            table.add_rows(-3),
            Err(TableError::InvalidRowCount { requested: -3 })
        );
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.get_value(0, "class").unwrap(), FieldValue::Int(0));
    }

    #[test]
    fn test_set_values_validates_before_writing() {
        let mut table = class_table();
        table.add_rows(3).unwrap();
        let err = table
            .set_values(
                0,
                &[FieldValue::Int(1), FieldValue::Bool(true), FieldValue::Int(3)],
                "class",
            )
            .unwrap_err();
        assert!(matches!(err, TableError::TypeMismatch { .. }));
        assert_eq!(table.get_value(0, "class").unwrap(), FieldValue::Int(0));

        table
            .set_values(1, &[FieldValue::Int(8), FieldValue::Int(9)], "class")
            .unwrap();
        assert_eq!(
            table.get_values(0, 3, "class").unwrap(),
            vec![FieldValue::Int(0), FieldValue::Int(8), FieldValue::Int(9)]
        );
    }

    #[test]
    fn test_neighbours_follow_row_growth() {
        let mut table = InMemoryAttributeTable::with_rows(2);
        table.set_neighbours(0, &[vec![1], vec![0]]).unwrap();
        table.add_rows(2).unwrap();

        assert_eq!(
            table.get_neighbours(0, 4).unwrap(),
            vec![vec![1], vec![0], Vec::new(), Vec::new()]
        );
        assert_eq!(
            table.set_neighbours(3, &[vec![2], vec![1]]),
            Err(TableError::RowIndexOutOfRange {
                row: 4,
                row_count: 4
            })
        );
        assert!(table.get_neighbours(3, 1).unwrap()[0].is_empty());
    }

    #[test]
    fn test_fill_column() {
        let mut table = class_table();
        table.add_rows(3).unwrap();
        table.fill_column("class", FieldValue::Int(5)).unwrap();
        assert_eq!(table.get_row(2).unwrap(), vec![FieldValue::Int(5)]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use kea_core::FieldType;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Row count is the sum of all growth requests, and every grown row
        /// reads as the default.
        #[test]
        fn prop_add_rows_accumulates(batches in prop::collection::vec(0i64..50, 0..8)) {
            let mut table = InMemoryAttributeTable::new();
            table.add_field("v", FieldType::Float, FieldValue::Float(2.5), "").unwrap();
            for &n in &batches {
                table.add_rows(n).unwrap();
            }
            let total: i64 = batches.iter().sum();
            prop_assert_eq!(table.row_count(), total as u64);
            for row in 0..table.row_count() {
                prop_assert_eq!(table.get_value(row, "v").unwrap(), FieldValue::Float(2.5));
            }
        }
    }
}
