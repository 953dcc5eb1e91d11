//! KEA Test Utilities
//!
//! Shared test infrastructure for the KEA workspace:
//! - Proptest generators for field types, values and specs
//! - Fixtures for images and populated tables
//! - Assertions for table errors and table contents

pub use kea_storage::{
    copy_table, AttributeTable, FileAttributeTable, InMemoryAttributeTable, KeaImage,
};

pub use kea_core::{
    AttributeTableKind, BandDataType, Field, FieldSpec, FieldType, FieldValue, ImageSpec,
    KeaConfig, KeaError, KeaResult, TableError, TableResult,
};

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for attribute table types.

    use super::*;
    use proptest::prelude::*;

    pub fn arb_field_type() -> impl Strategy<Value = FieldType> {
        prop_oneof![
            Just(FieldType::Bool),
            Just(FieldType::Int),
            Just(FieldType::Float),
            Just(FieldType::String),
        ]
    }

    /// A value of the given type.
    ///
    /// Floats cover the whole `f64` range, NaN and the infinities included,
    /// with the usual nodata values weighted up.
    pub fn arb_field_value(field_type: FieldType) -> BoxedStrategy<FieldValue> {
        match field_type {
            FieldType::Bool => any::<bool>().prop_map(FieldValue::Bool).boxed(),
            FieldType::Int => any::<i64>().prop_map(FieldValue::Int).boxed(),
            FieldType::Float => prop_oneof![
                4 => any::<f64>(),
                1 => Just(f64::NAN),
                1 => Just(f64::INFINITY),
                1 => Just(f64::NEG_INFINITY),
            ]
            .prop_map(FieldValue::Float)
            .boxed(),
            FieldType::String => "[a-zA-Z0-9 _\\-]{0,24}"
                .prop_map(FieldValue::String)
                .boxed(),
        }
    }

    pub fn arb_any_field_value() -> impl Strategy<Value = FieldValue> {
        arb_field_type().prop_flat_map(arb_field_value)
    }

    pub fn arb_field_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,11}"
    }

    pub fn arb_usage() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just("Generic".to_string()),
            Just("PixelCount".to_string()),
            Just("Name".to_string()),
            Just("Red".to_string()),
        ]
    }

    /// A spec whose default has the spec's type.
    pub fn arb_field_spec() -> impl Strategy<Value = FieldSpec> {
        (arb_field_name(), arb_field_type(), arb_usage()).prop_flat_map(|(name, t, usage)| {
            arb_field_value(t).prop_map(move |default| FieldSpec {
                name: name.clone(),
                field_type: t,
                default,
                usage: usage.clone(),
            })
        })
    }

    /// Specs with distinct names.
    pub fn arb_field_specs(max: usize) -> impl Strategy<Value = Vec<FieldSpec>> {
        prop::collection::vec(arb_field_spec(), 0..=max).prop_map(|specs| {
            let mut seen = std::collections::HashSet::new();
            specs
                .into_iter()
                .filter(|s| seen.insert(s.name.clone()))
                .collect()
        })
    }

    /// Neighbour lists for `rows` consecutive rows, ids below `rows`.
    pub fn arb_neighbours(rows: u64) -> impl Strategy<Value = Vec<Vec<u64>>> {
        let id = 0..rows.max(1);
        prop::collection::vec(prop::collection::vec(id, 0..4), rows as usize)
    }

    /// Row-growth requests, never negative.
    pub fn arb_row_batches() -> impl Strategy<Value = Vec<i64>> {
        prop::collection::vec(0i64..40, 0..5)
    }

    pub fn arb_valid_config() -> impl Strategy<Value = KeaConfig> {
        (1u64..64, 1u32..512, 64usize..65536, 1usize..32).prop_map(
            |(chunk, block, threshold, max_chunks)| {
                KeaConfig::new()
                    .with_attribute_chunk_size(chunk)
                    .with_image_block_size(block)
                    .with_cache_flush_threshold(threshold)
                    .with_cache_max_chunks(max_chunks)
                    .with_map_size_mb(64)
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built images and tables for common scenarios.

    use super::*;
    use tempfile::TempDir;

    /// A config with small chunks and a small map, so tests cross chunk
    /// boundaries and evict without large tables.
    pub fn small_config() -> KeaConfig {
        KeaConfig::new()
            .with_attribute_chunk_size(8)
            .with_cache_max_chunks(4)
            .with_map_size_mb(64)
    }

    /// A fresh single-band image in a temporary directory.
    ///
    /// Keep the `TempDir` alive for as long as the image is used.
    pub fn temp_image(config: KeaConfig) -> (KeaImage, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let spec = ImageSpec::new(64, 64, 1, BandDataType::UInt8);
        let image =
            KeaImage::create(temp_dir.path(), &spec, config).expect("image creation should succeed");
        (image, temp_dir)
    }

    /// The specs of a three-field table: Int, Float and String.
    pub fn mixed_specs() -> Vec<FieldSpec> {
        vec![
            FieldSpec::new("class", FieldType::Int, 0i64, "PixelCount"),
            FieldSpec::new("area", FieldType::Float, -1.0, "Generic"),
            FieldSpec::new("label", FieldType::String, "unclassified", "Name"),
        ]
    }

    /// An in-memory table with the mixed fields and `rows` rows, where row
    /// `r` holds `class = r`.
    pub fn populated_table(rows: u64) -> InMemoryAttributeTable {
        let mut table = InMemoryAttributeTable::with_rows(rows);
        table
            .add_fields(&mixed_specs())
            .expect("fixture fields are valid");
        let classes: Vec<FieldValue> = (0..rows as i64).map(FieldValue::Int).collect();
        table
            .set_values(0, &classes, "class")
            .expect("fixture values are valid");
        table
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for table errors and contents.

    use super::*;

    /// Assert that a TableResult is a DuplicateFieldName error for `name`.
    #[track_caller]
    pub fn assert_duplicate_field<T: std::fmt::Debug>(result: &TableResult<T>, name: &str) {
        match result {
            Err(TableError::DuplicateFieldName { name: n }) => {
                assert_eq!(n, name, "Wrong field in DuplicateFieldName error")
            }
            other => panic!("Expected DuplicateFieldName({}), got: {:?}", name, other),
        }
    }

    /// Assert that a TableResult is an UnknownField error.
    #[track_caller]
    pub fn assert_unknown_field<T: std::fmt::Debug>(result: &TableResult<T>) {
        match result {
            Err(TableError::UnknownField { .. }) => {}
            other => panic!("Expected UnknownField error, got: {:?}", other),
        }
    }

    /// Assert that a TableResult is a TypeMismatch error.
    #[track_caller]
    pub fn assert_type_mismatch<T: std::fmt::Debug>(result: &TableResult<T>) {
        match result {
            Err(TableError::TypeMismatch { .. }) => {}
            other => panic!("Expected TypeMismatch error, got: {:?}", other),
        }
    }

    /// Assert that a TableResult is a RowIndexOutOfRange error.
    #[track_caller]
    pub fn assert_row_out_of_range<T: std::fmt::Debug>(result: &TableResult<T>) {
        match result {
            Err(TableError::RowIndexOutOfRange { .. }) => {}
            other => panic!("Expected RowIndexOutOfRange error, got: {:?}", other),
        }
    }

    /// Assert that every row of `field` reads as `expected`.
    #[track_caller]
    pub fn assert_column_is(table: &dyn AttributeTable, field: &str, expected: &FieldValue) {
        let values = table
            .get_values(0, table.row_count(), field)
            .expect("column should be readable");
        for (row, value) in values.iter().enumerate() {
            assert_eq!(value, expected, "Unexpected value in '{}' at row {}", field, row);
        }
    }

    /// Assert that two tables have the same fields, cell values and
    /// neighbour lists.
    #[track_caller]
    pub fn assert_tables_equal(left: &dyn AttributeTable, right: &dyn AttributeTable) {
        assert_eq!(left.fields(), right.fields(), "Field lists differ");
        assert_eq!(left.row_count(), right.row_count(), "Row counts differ");
        for field in left.fields() {
            let l = left
                .get_values(0, left.row_count(), &field.name)
                .expect("left column should be readable");
            let r = right
                .get_values(0, right.row_count(), &field.name)
                .expect("right column should be readable");
            assert_eq!(l, r, "Column '{}' differs", field.name);
        }
        assert_eq!(
            left.get_neighbours(0, left.row_count())
                .expect("left neighbours should be readable"),
            right
                .get_neighbours(0, right.row_count())
                .expect("right neighbours should be readable"),
            "Neighbour lists differ"
        );
    }
}
