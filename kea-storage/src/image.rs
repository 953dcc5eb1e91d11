//! Image-band manager.
//!
//! A [`KeaImage`] owns an open [`Container`] and its header. It creates
//! bands, reports which bands carry an attribute table, and hands out
//! tables bound to a band. It never keeps a table object itself.

use std::path::Path;
use std::sync::Arc;

use kea_core::{
    AttributeTableKind, BandDataType, ImageError, ImageSpec, KeaConfig, KeaError, KeaResult,
    TableResult,
};

use crate::container::{Batch, Container};
use crate::layout::{self, BandMeta, ImageHeader, PixelRegion};
use crate::{copy_table, AttributeTable, FileAttributeTable, InMemoryAttributeTable};

/// Metadata of one band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Band {
    /// 1-based band number.
    pub index: u32,
    pub data_type: BandDataType,
    pub description: String,
    pub block_size: u32,
    pub att_chunk_size: u64,
    pub x_size: u64,
    pub y_size: u64,
    pub has_attribute_table: bool,
}

/// An open KEA image container.
#[derive(Debug)]
pub struct KeaImage {
    container: Option<Arc<Container>>,
    header: ImageHeader,
    config: KeaConfig,
}

impl KeaImage {
    /// Create a new container at `path` with the bands described by `spec`.
    ///
    /// A container already at `path` is emptied first, tables included.
    ///
    /// # Errors
    ///
    /// - `InvalidDimensions` if either size is zero
    /// - config validation errors
    /// - `BackendIOFailure` if the container cannot be written
    pub fn create<P: AsRef<Path>>(path: P, spec: &ImageSpec, config: KeaConfig) -> KeaResult<Self> {
        config.validate()?;
        if spec.x_size == 0 || spec.y_size == 0 {
            return Err(ImageError::InvalidDimensions {
                x_size: spec.x_size,
                y_size: spec.y_size,
            }
            .into());
        }

        let container = Container::create(path.as_ref(), config.map_size_mb)?;
        let header = ImageHeader {
            version: layout::FORMAT_VERSION.to_string(),
            x_size: spec.x_size,
            y_size: spec.y_size,
            num_bands: spec.num_bands,
        };

        container.write(|batch| -> KeaResult<()> {
            batch.clear()?;
            batch.put_json(layout::HEADER_KEY, &header)?;
            for index in 1..=spec.num_bands {
                let description = spec
                    .band_descriptions
                    .get(index as usize - 1)
                    .cloned()
                    .unwrap_or_default();
                Self::add_image_band_to_file(
                    batch,
                    &header,
                    index,
                    spec.data_type,
                    &description,
                    config.image_block_size,
                    config.attribute_chunk_size,
                )?;
            }
            Ok(())
        })?;

        tracing::info!(
            path = %path.as_ref().display(),
            x_size = header.x_size,
            y_size = header.y_size,
            num_bands = header.num_bands,
            "Created image"
        );

        Ok(Self {
            container: Some(Arc::new(container)),
            header,
            config,
        })
    }

    /// Open an existing container.
    ///
    /// # Errors
    ///
    /// `NotFound` if nothing exists at `path`; nothing is created.
    pub fn open<P: AsRef<Path>>(path: P, config: KeaConfig) -> KeaResult<Self> {
        config.validate()?;
        let container = Container::open(path.as_ref(), config.map_size_mb)?;
        let header = container
            .get_json::<ImageHeader>(layout::HEADER_KEY)?
            .ok_or_else(|| ImageError::CorruptHeader {
                key: layout::HEADER_KEY.to_string(),
                reason: "missing image header".to_string(),
            })?;

        tracing::debug!(
            path = %path.as_ref().display(),
            num_bands = header.num_bands,
            "Opened image"
        );

        Ok(Self {
            container: Some(Arc::new(container)),
            header,
            config,
        })
    }

    /// Close the container.
    ///
    /// Attribute tables opened from this image keep the container alive
    /// until they are closed; the files are released when the last one
    /// goes.
    pub fn close(&mut self) -> KeaResult<()> {
        let container = self.container.take().ok_or(ImageError::NotOpen)?;
        match Arc::try_unwrap(container) {
            Ok(container) => container.close()?,
            Err(_) => tracing::debug!("Image closed while attribute tables are still open"),
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.container.is_some()
    }

    pub fn config(&self) -> &KeaConfig {
        &self.config
    }

    pub fn x_size(&self) -> u64 {
        self.header.x_size
    }

    pub fn y_size(&self) -> u64 {
        self.header.y_size
    }

    pub fn num_bands(&self) -> u32 {
        self.header.num_bands
    }

    fn container(&self) -> KeaResult<&Arc<Container>> {
        self.container
            .as_ref()
            .ok_or_else(|| ImageError::NotOpen.into())
    }

    fn check_band(&self, band: u32) -> KeaResult<()> {
        if band == 0 || band > self.header.num_bands {
            return Err(ImageError::BandOutOfRange {
                band,
                num_bands: self.header.num_bands,
            }
            .into());
        }
        Ok(())
    }

    fn band_meta(&self, band: u32) -> KeaResult<BandMeta> {
        self.check_band(band)?;
        let key = layout::band_meta_key(band);
        self.container()?
            .get_json::<BandMeta>(&key)?
            .ok_or_else(|| {
                ImageError::CorruptHeader {
                    key,
                    reason: "missing band metadata".to_string(),
                }
                .into()
            })
    }

    // === Bands ===

    /// Append a band to the open image and return its metadata.
    ///
    /// `block_size` defaults to the configured image block size; an empty
    /// description becomes "Band N".
    pub fn add_image_band(
        &mut self,
        data_type: BandDataType,
        description: &str,
        block_size: Option<u32>,
    ) -> KeaResult<Band> {
        let container = self.container()?.clone();
        let index = self.header.num_bands + 1;
        let mut header = self.header.clone();
        header.num_bands = index;

        let block_size = block_size.unwrap_or(self.config.image_block_size);
        let chunk_size = self.config.attribute_chunk_size;
        let band = container.write(|batch| -> KeaResult<Band> {
            let band = Self::add_image_band_to_file(
                batch,
                &header,
                index,
                data_type,
                description,
                block_size,
                chunk_size,
            )?;
            batch.put_json(layout::HEADER_KEY, &header)?;
            Ok(band)
        })?;

        self.header = header;
        Ok(band)
    }

    /// Write the metadata and pixel region descriptor of band `index` into
    /// an open transaction.
    ///
    /// The pixel region is block tiled and reads as zero until blocks are
    /// written. No attribute table is attached.
    pub fn add_image_band_to_file(
        batch: &mut Batch<'_>,
        header: &ImageHeader,
        index: u32,
        data_type: BandDataType,
        description: &str,
        block_size: u32,
        att_chunk_size: u64,
    ) -> KeaResult<Band> {
        let description = if description.is_empty() {
            format!("Band {index}")
        } else {
            description.to_string()
        };
        let min_dim = header.x_size.min(header.y_size).max(1);
        let block_size = u32::try_from(u64::from(block_size.max(1)).min(min_dim))
            .unwrap_or(block_size);

        let meta = BandMeta {
            data_type,
            description: description.clone(),
            block_size,
            att_chunk_size,
        };
        let region = PixelRegion {
            x_size: header.x_size,
            y_size: header.y_size,
            block_size,
            data_type,
            fill: 0,
        };
        batch.put_json(&layout::band_meta_key(index), &meta)?;
        batch.put_json(&layout::band_data_key(index), &region)?;

        let (blocks_x, blocks_y) = region.block_grid();
        tracing::info!(
            band = index,
            data_type = %data_type,
            block_size,
            blocks_x,
            blocks_y,
            "Added image band"
        );

        Ok(Band {
            index,
            data_type,
            description,
            block_size,
            att_chunk_size,
            x_size: header.x_size,
            y_size: header.y_size,
            has_attribute_table: false,
        })
    }

    /// Metadata of band `band`.
    pub fn band(&self, band: u32) -> KeaResult<Band> {
        let meta = self.band_meta(band)?;
        Ok(Band {
            index: band,
            data_type: meta.data_type,
            description: meta.description,
            block_size: meta.block_size,
            att_chunk_size: meta.att_chunk_size,
            x_size: self.header.x_size,
            y_size: self.header.y_size,
            has_attribute_table: self.attribute_table_present(band)?,
        })
    }

    pub fn band_description(&self, band: u32) -> KeaResult<String> {
        Ok(self.band_meta(band)?.description)
    }

    pub fn set_band_description(&self, band: u32, description: &str) -> KeaResult<()> {
        let mut meta = self.band_meta(band)?;
        meta.description = description.to_string();
        self.container()?.write(|batch| -> KeaResult<()> {
            batch.put_json(&layout::band_meta_key(band), &meta)?;
            Ok(())
        })
    }

    pub fn band_data_type(&self, band: u32) -> KeaResult<BandDataType> {
        Ok(self.band_meta(band)?.data_type)
    }

    pub fn pixel_region(&self, band: u32) -> KeaResult<PixelRegion> {
        self.check_band(band)?;
        let key = layout::band_data_key(band);
        self.container()?
            .get_json::<PixelRegion>(&key)?
            .ok_or_else(|| {
                ImageError::CorruptHeader {
                    key,
                    reason: "missing pixel region".to_string(),
                }
                .into()
            })
    }

    /// Rows per column chunk of the band's attribute table.
    pub fn attribute_table_chunk_size(&self, band: u32) -> KeaResult<u64> {
        Ok(self.band_meta(band)?.att_chunk_size)
    }

    // === Attribute tables ===

    /// True iff a table has been attached to `band`, even one with no
    /// fields.
    pub fn attribute_table_present(&self, band: u32) -> KeaResult<bool> {
        self.check_band(band)?;
        Ok(self.container()?.contains(&layout::fields_key(band))?)
    }

    /// Attach a table to `band`, or open the one already attached.
    pub fn create_attribute_table(&self, band: u32) -> KeaResult<FileAttributeTable> {
        let chunk_size = self.attribute_table_chunk_size(band)?;
        FileAttributeTable::create(self.container()?.clone(), band, chunk_size, &self.config)
    }

    /// Open the table attached to `band`.
    ///
    /// # Errors
    ///
    /// `NoAttributeTable` if nothing has been attached.
    pub fn open_attribute_table(&self, band: u32) -> KeaResult<FileAttributeTable> {
        self.check_band(band)?;
        FileAttributeTable::open(self.container()?.clone(), band, &self.config)
    }

    /// The band's table materialised with the requested backend.
    ///
    /// `File` attaches a table if the band has none; its changes are durable
    /// once [`AttributeTable::flush`] returns. `InMemory` returns a detached
    /// copy of the stored table, or an empty table if none is attached; it
    /// never writes to the container.
    pub fn attribute_table(
        &self,
        kind: AttributeTableKind,
        band: u32,
    ) -> KeaResult<Box<dyn AttributeTable>> {
        match kind {
            AttributeTableKind::File => Ok(Box::new(self.create_attribute_table(band)?)),
            AttributeTableKind::InMemory => {
                let mut table = InMemoryAttributeTable::new();
                if self.attribute_table_present(band)? {
                    let stored = self.open_attribute_table(band)?;
                    copy_table(&stored, &mut table)?;
                }
                Ok(Box::new(table))
            }
        }
    }

    /// Store `table` in `band`, attaching a table if needed, and flush.
    pub fn set_attribute_table(&self, table: &dyn AttributeTable, band: u32) -> KeaResult<()> {
        let mut target = self.create_attribute_table(band)?;
        copy_table(table, &mut target)?;
        target.close()?;
        tracing::info!(
            band,
            fields = table.field_count(),
            rows = table.row_count(),
            "Stored attribute table"
        );
        Ok(())
    }

    /// Run `f` against the band's table, then flush and release it whether
    /// or not `f` succeeded.
    ///
    /// The closure's error wins over a flush error.
    pub fn with_attribute_table<T>(
        &self,
        band: u32,
        f: impl FnOnce(&mut FileAttributeTable) -> TableResult<T>,
    ) -> KeaResult<T> {
        let mut table = self.create_attribute_table(band)?;
        let result = f(&mut table);
        let flushed = table.close();
        match (result, flushed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(KeaError::from(e)),
            (Err(e), flushed) => {
                if let Err(flush_err) = flushed {
                    tracing::warn!(band, error = %flush_err, "Flush after failed table operation also failed");
                }
                Err(KeaError::from(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kea_core::{FieldType, FieldValue, TableError};
    use tempfile::TempDir;

    fn create_image(bands: u32) -> (KeaImage, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let spec = ImageSpec::new(100, 50, bands, BandDataType::UInt8);
        let image = KeaImage::create(temp_dir.path(), &spec, KeaConfig::default())
            .expect("image creation should succeed");
        (image, temp_dir)
    }

    #[test]
    fn test_create_rejects_empty_dimensions() {
        let temp_dir = TempDir::new().unwrap();
        let spec = ImageSpec::new(0, 10, 1, BandDataType::Float32);
        let err = KeaImage::create(temp_dir.path(), &spec, KeaConfig::default()).unwrap_err();
        assert_eq!(
            err,
            KeaError::Image(ImageError::InvalidDimensions {
                x_size: 0,
                y_size: 10
            })
        );
    }

    #[test]
    fn test_default_band_descriptions() {
        let (image, _dir) = create_image(2);
        assert_eq!(image.num_bands(), 2);
        assert_eq!(image.band_description(1).unwrap(), "Band 1");
        assert_eq!(image.band_description(2).unwrap(), "Band 2");
    }

    #[test]
    fn test_block_size_clamped_to_image() {
        let (image, _dir) = create_image(1);
        let band = image.band(1).unwrap();
        assert_eq!(band.block_size, 50);
        assert_eq!(image.pixel_region(1).unwrap().block_grid(), (2, 1));
    }

    #[test]
    fn test_band_out_of_range() {
        let (image, _dir) = create_image(1);
        for band in [0, 2] {
            assert_eq!(
                image.attribute_table_present(band),
                Err(KeaError::Image(ImageError::BandOutOfRange { band, num_bands: 1 }))
            );
        }
    }

    #[test]
    fn test_add_band_has_no_table_until_attached() {
        let (mut image, _dir) = create_image(1);
        let band = image
            .add_image_band(BandDataType::Int16, "elevation", Some(32))
            .unwrap();
        assert_eq!(band.index, 2);
        assert_eq!(band.block_size, 32);
        assert!(!band.has_attribute_table);
        assert!(!image.attribute_table_present(2).unwrap());

        let table = image.create_attribute_table(2).unwrap();
        assert_eq!(table.field_count(), 0);
        assert!(image.attribute_table_present(2).unwrap());
        assert!(image.band(2).unwrap().has_attribute_table);
        assert!(!image.attribute_table_present(1).unwrap());
    }

    #[test]
    fn test_open_without_table() {
        let (image, _dir) = create_image(1);
        assert_eq!(
            image.open_attribute_table(1).unwrap_err(),
            KeaError::Image(ImageError::NoAttributeTable { band: 1 })
        );
    }

    #[test]
    fn test_set_band_description_persists() {
        let temp_dir = TempDir::new().unwrap();
        let spec = ImageSpec::new(10, 10, 1, BandDataType::UInt8);
        let mut image = KeaImage::create(temp_dir.path(), &spec, KeaConfig::default()).unwrap();
        image.set_band_description(1, "landcover").unwrap();
        image.close().unwrap();
        assert!(!image.is_open());
        assert_eq!(image.band_description(1), Err(KeaError::Image(ImageError::NotOpen)));

        let image = KeaImage::open(temp_dir.path(), KeaConfig::default()).unwrap();
        assert_eq!(image.band_description(1).unwrap(), "landcover");
        assert_eq!(image.band_data_type(1).unwrap(), BandDataType::UInt8);
    }

    #[test]
    fn test_with_attribute_table_flushes_on_error() {
        let (image, _dir) = create_image(1);
        let err = image
            .with_attribute_table(1, |table| {
                table.add_field("class", FieldType::Int, FieldValue::Int(0), "")?;
                table.add_rows(3)?;
                table.set_value(9, "class", FieldValue::Int(1))
            })
            .unwrap_err();
        assert_eq!(
            err.as_table_error(),
            Some(&TableError::RowIndexOutOfRange {
                row: 9,
                row_count: 3
            })
        );

        let table = image.open_attribute_table(1).unwrap();
        assert_eq!(table.field_names(), vec!["class"]);
        assert_eq!(table.row_count(), 3);
    }

    #[test]
    fn test_in_memory_copy_is_detached() {
        let (image, _dir) = create_image(1);
        image
            .with_attribute_table(1, |table| {
                table.add_field("area", FieldType::Float, FieldValue::Float(0.0), "")?;
                table.add_rows(2)?;
                table.set_value(1, "area", FieldValue::Float(12.5))
            })
            .unwrap();

        let mut copy = image
            .attribute_table(AttributeTableKind::InMemory, 1)
            .unwrap();
        assert_eq!(copy.kind(), AttributeTableKind::InMemory);
        assert_eq!(copy.get_value(1, "area").unwrap(), FieldValue::Float(12.5));

        copy.add_rows(10).unwrap();
        let stored = image.open_attribute_table(1).unwrap();
        assert_eq!(stored.row_count(), 2);
    }

    #[test]
    fn test_set_attribute_table_round_trip() {
        let (image, _dir) = create_image(1);
        let mut source = InMemoryAttributeTable::new();
        source
            .add_field("name", FieldType::String, FieldValue::from(""), "Name")
            .unwrap();
        source.add_rows(3).unwrap();
        source.set_value(2, "name", FieldValue::from("lake")).unwrap();

        image.set_attribute_table(&source, 1).unwrap();

        let stored = image.attribute_table(AttributeTableKind::File, 1).unwrap();
        assert_eq!(stored.kind(), AttributeTableKind::File);
        assert_eq!(stored.row_count(), 3);
        assert_eq!(stored.get_value(2, "name").unwrap(), FieldValue::from("lake"));
    }

    #[test]
    fn test_create_over_existing_image_drops_tables() {
        let temp_dir = TempDir::new().unwrap();
        let spec = ImageSpec::new(10, 10, 1, BandDataType::UInt8);
        let mut image = KeaImage::create(temp_dir.path(), &spec, KeaConfig::default()).unwrap();
        image
            .with_attribute_table(1, |table| {
                table.add_field("a", FieldType::Int, FieldValue::Int(0), "")?;
                table.add_rows(4)
            })
            .unwrap();
        image.set_band_description(1, "old").unwrap();
        image.close().unwrap();

        let image = KeaImage::create(temp_dir.path(), &spec, KeaConfig::default()).unwrap();
        assert!(!image.attribute_table_present(1).unwrap());
        assert_eq!(image.band_description(1).unwrap(), "Band 1");
        assert_eq!(
            image.open_attribute_table(1).unwrap_err(),
            KeaError::Image(ImageError::NoAttributeTable { band: 1 })
        );
    }

    #[test]
    fn test_open_missing_image_creates_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.kea");
        let err = KeaImage::open(&path, KeaConfig::default()).unwrap_err();
        assert!(matches!(err, KeaError::Image(ImageError::NotFound { .. })));
        assert!(!path.exists());
    }

    #[test]
    fn test_boxed_file_table_flushes() {
        let (image, _dir) = create_image(1);
        {
            let mut table = image.attribute_table(AttributeTableKind::File, 1).unwrap();
            table
                .add_field("class", FieldType::Int, FieldValue::Int(0), "")
                .unwrap();
            table.add_rows(5).unwrap();
            table.set_value(2, "class", FieldValue::Int(7)).unwrap();
            table.flush().unwrap();
        }

        let table = image.open_attribute_table(1).unwrap();
        assert_eq!(table.field_names(), vec!["class"]);
        assert_eq!(table.row_count(), 5);
        assert_eq!(table.get_value(2, "class").unwrap(), FieldValue::Int(7));
    }

    #[test]
    fn test_nan_default_table_reopens() {
        let (image, _dir) = create_image(1);
        image
            .with_attribute_table(1, |table| {
                table.add_field("nodata", FieldType::Float, FieldValue::Float(f64::NAN), "")?;
                table.add_rows(3)
            })
            .unwrap();

        assert!(image.attribute_table_present(1).unwrap());
        let table = image.open_attribute_table(1).unwrap();
        assert_eq!(table.row_count(), 3);
        assert_eq!(
            table.get_value(1, "nodata").unwrap(),
            FieldValue::Float(f64::NAN)
        );
    }
}
