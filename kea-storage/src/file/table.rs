//! Attribute table persisted in a container band.

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use kea_core::{
    AttributeTableKind, Field, FieldSchema, FieldSpec, FieldType, FieldValue, ImageError,
    KeaConfig, KeaResult, TableError, TableResult,
};

use super::cache::{CacheStats, ChunkCache, ChunkKey};
use super::chunk::ColumnData;
use super::neighbours::{self, NeighbourCache};
use crate::container::{Batch, Container};
use crate::layout::{self, SizeMarker};
use crate::{check_batch, check_range, check_row, grown_row_count, AttributeTable};

/// Durable state of a band's table as last flushed.
struct DurableState {
    schema: FieldSchema,
    rows: u64,
    chunk_size: u64,
    generation: u64,
}

/// Attribute table backed by column chunks in a container band.
///
/// Schema changes, row growth and cell writes are buffered and become
/// durable together on [`flush`](Self::flush) or [`close`](Self::close).
/// Dropping a table with pending changes discards them.
pub struct FileAttributeTable {
    container: Arc<Container>,
    band: u32,
    chunk_size: u64,
    schema: FieldSchema,
    row_count: u64,
    durable_fields: usize,
    durable_rows: u64,
    /// Layout generation this handle last loaded or wrote.
    generation: u64,
    layout_lock: Arc<RwLock<()>>,
    cache: Mutex<ChunkCache>,
    neighbours: Mutex<NeighbourCache>,
    flush_threshold_bytes: usize,
    max_chunks: usize,
}

impl std::fmt::Debug for FileAttributeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAttributeTable")
            .field("band", &self.band)
            .field("chunk_size", &self.chunk_size)
            .field("fields", &self.schema.len())
            .field("row_count", &self.row_count)
            .field("generation", &self.generation)
            .finish()
    }
}

impl FileAttributeTable {
    /// Attach an empty table to `band`, or open the one already attached.
    ///
    /// Attaching writes the field list, size marker, chunk size and
    /// generation at once, so the band reports a table even before the
    /// first flush. `chunk_size` only applies to a new table; an attached
    /// table keeps the chunk size it was written with.
    pub fn create(
        container: Arc<Container>,
        band: u32,
        chunk_size: u64,
        config: &KeaConfig,
    ) -> KeaResult<Self> {
        let chunk_size = chunk_size.max(1);
        let attached = container.write(|batch| -> TableResult<bool> {
            if batch.get(&layout::fields_key(band))?.is_some() {
                return Ok(false);
            }
            write_layout(batch, band, &FieldSchema::new(), 0, chunk_size, 0)?;
            Ok(true)
        })?;
        if attached {
            tracing::info!(band, chunk_size, "Attached attribute table");
        }
        Self::open(container, band, config)
    }

    /// Open the table attached to `band` with its stored chunk size.
    ///
    /// # Errors
    ///
    /// `NoAttributeTable` if nothing has been attached to the band.
    pub fn open(container: Arc<Container>, band: u32, config: &KeaConfig) -> KeaResult<Self> {
        let state =
            read_durable(&container, band)?.ok_or(ImageError::NoAttributeTable { band })?;
        let layout_lock = container.layout_lock(band)?;

        tracing::debug!(
            band,
            fields = state.schema.len(),
            rows = state.rows,
            chunk_size = state.chunk_size,
            generation = state.generation,
            "Opened attribute table"
        );

        Ok(Self {
            container,
            band,
            chunk_size: state.chunk_size,
            durable_fields: state.schema.len(),
            schema: state.schema,
            row_count: state.rows,
            durable_rows: state.rows,
            generation: state.generation,
            layout_lock,
            cache: Mutex::new(ChunkCache::new()),
            neighbours: Mutex::new(NeighbourCache::new()),
            flush_threshold_bytes: config.cache_flush_threshold_bytes,
            max_chunks: config.cache_max_chunks,
        })
    }

    pub fn band(&self) -> u32 {
        self.band
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cache_stats(&self) -> TableResult<CacheStats> {
        Ok(self.lock_cache()?.stats())
    }

    /// True if anything has changed since the last flush.
    pub fn has_pending_changes(&self) -> bool {
        self.schema.len() != self.durable_fields
            || self.row_count != self.durable_rows
            || self.cache.lock().map(|c| c.has_dirty()).unwrap_or(true)
            || self.neighbours.lock().map(|n| n.has_dirty()).unwrap_or(true)
    }

    /// Write every pending change in one container transaction.
    ///
    /// # Errors
    ///
    /// - `SchemaConflict` if another handle changed the layout since this
    ///   one loaded it; nothing is written.
    /// - `BackendIOFailure` if the transaction fails; the durable state is
    ///   the previous flush and pending changes are kept for a retry.
    pub fn flush(&mut self) -> TableResult<()> {
        let _layout = self
            .layout_lock
            .read()
            .map_err(|_| TableError::LockPoisoned)?;
        let mut cache = self.cache.lock().map_err(|_| TableError::LockPoisoned)?;
        let mut lists = self
            .neighbours
            .lock()
            .map_err(|_| TableError::LockPoisoned)?;

        let layout_changed =
            self.schema.len() != self.durable_fields || self.row_count != self.durable_rows;
        if !layout_changed && !cache.has_dirty() && !lists.has_dirty() {
            return Ok(());
        }

        let band = self.band;
        let chunk_size = self.chunk_size;
        let expected = self.generation;
        let dirty = cache.dirty_chunks();
        let dirty_lists = lists.dirty_chunks();
        let chunks_written = dirty.len() + dirty_lists.len();

        let result = self.container.write(|batch| -> TableResult<()> {
            let generation_key = layout::generation_key(band);
            let found =
                layout::decode_generation(&generation_key, batch.get(&generation_key)?.as_deref())?;
            if found != expected {
                return Err(TableError::SchemaConflict {
                    band,
                    expected,
                    found,
                });
            }
            if layout_changed {
                write_layout(
                    batch,
                    band,
                    &self.schema,
                    self.row_count,
                    chunk_size,
                    expected + 1,
                )?;
            }
            for (key, data) in &dirty {
                let encoded = data.encode();
                batch.put(&layout::chunk_key(band, key.field, key.chunk), &encoded.region)?;
                if let Some(blob) = encoded.blob {
                    batch.put(&layout::blob_key(band, key.field, key.chunk), &blob)?;
                }
            }
            for (chunk, run) in &dirty_lists {
                batch.put(&layout::neighbours_key(band, *chunk), &neighbours::encode(run))?;
            }
            Ok(())
        });
        drop(dirty);
        drop(dirty_lists);

        if let Err(e) = result {
            tracing::warn!(
                band,
                error = %e,
                "Attribute table flush aborted, pending changes retained"
            );
            return Err(e);
        }

        cache.mark_flushed();
        lists.mark_flushed();
        if layout_changed {
            self.generation = expected + 1;
        }
        self.durable_fields = self.schema.len();
        self.durable_rows = self.row_count;

        tracing::info!(
            band,
            fields = self.schema.len(),
            rows = self.row_count,
            chunks = chunks_written,
            generation = self.generation,
            "Flushed attribute table"
        );
        Ok(())
    }

    /// Drop pending changes and reload the last flushed state.
    pub fn discard_pending(&mut self) -> TableResult<()> {
        let _layout = self
            .layout_lock
            .write()
            .map_err(|_| TableError::LockPoisoned)?;
        let state = read_durable(&self.container, self.band)?.ok_or_else(|| {
            TableError::BackendIOFailure {
                reason: format!("attribute table marker for band {} is missing", self.band),
            }
        })?;
        self.lock_cache()?.clear();
        self.lock_neighbours()?.clear();

        tracing::debug!(
            band = self.band,
            discarded_fields = self.schema.len().saturating_sub(state.schema.len()),
            "Discarded pending attribute table changes"
        );

        self.durable_fields = state.schema.len();
        self.schema = state.schema;
        self.row_count = state.rows;
        self.durable_rows = state.rows;
        self.generation = state.generation;
        Ok(())
    }

    /// Flush and release the table.
    pub fn close(mut self) -> TableResult<()> {
        self.flush()
    }

    // === Chunk plumbing ===

    fn lock_cache(&self) -> TableResult<MutexGuard<'_, ChunkCache>> {
        self.cache.lock().map_err(|_| TableError::LockPoisoned)
    }

    fn lock_neighbours(&self) -> TableResult<MutexGuard<'_, NeighbourCache>> {
        self.neighbours.lock().map_err(|_| TableError::LockPoisoned)
    }

    fn chunk_count(&self) -> u64 {
        self.row_count.div_ceil(self.chunk_size)
    }

    /// Rows covered by `chunk` at the current row count.
    fn chunk_len(&self, chunk: u64) -> usize {
        let start = chunk * self.chunk_size;
        self.chunk_size.min(self.row_count.saturating_sub(start)) as usize
    }

    fn locate(&self, row: u64) -> (u64, usize) {
        (row / self.chunk_size, (row % self.chunk_size) as usize)
    }

    /// Make `chunk` of `field` resident and padded to its current length.
    fn ensure_loaded(&self, cache: &mut ChunkCache, field: &Field, chunk: u64) -> TableResult<ChunkKey> {
        let key = ChunkKey {
            field: field.index,
            chunk,
        };
        let len = self.chunk_len(chunk);
        if cache.get(key).is_some() {
            cache.pad(key, len, &field.default);
            return Ok(key);
        }

        let data = self.load_chunk(field, chunk, len)?;
        let evicted = cache.evict_clean(self.max_chunks.saturating_sub(1));
        if evicted > 0 {
            tracing::debug!(band = self.band, evicted, "Evicted clean attribute chunks");
        }
        cache.insert_clean(key, data);
        Ok(key)
    }

    /// Read a chunk from the container. Unallocated chunks, and fields not
    /// yet flushed, read as the field's default.
    fn load_chunk(&self, field: &Field, chunk: u64, len: usize) -> TableResult<ColumnData> {
        if field.index >= self.durable_fields {
            return Ok(ColumnData::filled(&field.default, len));
        }
        let region_key = layout::chunk_key(self.band, field.index, chunk);
        let Some(region) = self.container.get(&region_key)? else {
            return Ok(ColumnData::filled(&field.default, len));
        };
        let blob = match field.field_type {
            FieldType::String => self
                .container
                .get(&layout::blob_key(self.band, field.index, chunk))?,
            _ => None,
        };
        let mut data = ColumnData::decode(&region_key, field.field_type, &region, blob.as_deref())?;
        data.pad_to(len, &field.default);
        Ok(data)
    }

    /// Make the neighbour lists of `chunk` resident and padded to its
    /// current length.
    fn ensure_neighbours(&self, cache: &mut NeighbourCache, chunk: u64) -> TableResult<()> {
        let len = self.chunk_len(chunk);
        if cache.get(chunk).is_some() {
            cache.pad(chunk, len);
            return Ok(());
        }
        let key = layout::neighbours_key(self.band, chunk);
        let mut lists = match self.container.get(&key)? {
            Some(bytes) => neighbours::decode(&key, &bytes)?,
            None => Vec::new(),
        };
        if lists.len() < len {
            lists.resize(len, Vec::new());
        }
        cache.insert_clean(chunk, lists, self.max_chunks);
        Ok(())
    }

    fn maybe_flush(&mut self) -> TableResult<()> {
        let dirty = self.lock_cache()?.dirty_bytes() + self.lock_neighbours()?.dirty_bytes();
        let over = dirty > self.flush_threshold_bytes;
        if over {
            tracing::debug!(band = self.band, "Dirty cache over threshold, flushing");
            self.flush()?;
        }
        Ok(())
    }

    /// Apply `values` to consecutive rows of `field` from `start`, chunk by
    /// chunk. Values are already validated.
    fn write_run(&self, field: &Field, start: u64, values: &[FieldValue]) -> TableResult<()> {
        let mut cache = self.lock_cache()?;
        let mut row = start;
        let mut remaining = values;
        while !remaining.is_empty() {
            let (chunk, offset) = self.locate(row);
            let take = (self.chunk_size as usize - offset).min(remaining.len());
            let (run, rest) = remaining.split_at(take);

            let key = self.ensure_loaded(&mut cache, field, chunk)?;
            let extra: usize = run
                .iter()
                .map(|v| v.as_str().map_or(0, str::len))
                .sum();
            let data = cache
                .get_mut_dirty(key, extra)
                .ok_or_else(|| evicted_error(key))?;
            for (i, value) in run.iter().enumerate() {
                data.set(offset + i, value.clone());
            }

            row += take as u64;
            remaining = rest;
        }
        Ok(())
    }
}

impl AttributeTable for FileAttributeTable {
    fn kind(&self) -> AttributeTableKind {
        AttributeTableKind::File
    }

    fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    fn row_count(&self) -> u64 {
        self.row_count
    }

    fn add_fields(&mut self, specs: &[FieldSpec]) -> TableResult<Vec<Field>> {
        let _layout = self
            .layout_lock
            .write()
            .map_err(|_| TableError::LockPoisoned)?;
        let planned = self.schema.plan(specs)?;
        for field in &planned {
            tracing::debug!(
                band = self.band,
                field = %field.name,
                field_type = %field.field_type,
                index = field.index,
                "Registered attribute field"
            );
        }
        self.schema.commit(planned.clone());
        Ok(planned)
    }

    fn add_rows(&mut self, count: i64) -> TableResult<()> {
        let _layout = self
            .layout_lock
            .read()
            .map_err(|_| TableError::LockPoisoned)?;
        let rows = grown_row_count(self.row_count, count)?;
        if rows != self.row_count {
            tracing::debug!(band = self.band, from = self.row_count, to = rows, "Grew attribute table");
            self.row_count = rows;
        }
        Ok(())
    }

    fn get_value(&self, row: u64, field: &str) -> TableResult<FieldValue> {
        let field = self.schema.require(field)?;
        check_row(row, self.row_count)?;
        let (chunk, offset) = self.locate(row);

        let mut cache = self.lock_cache()?;
        let key = self.ensure_loaded(&mut cache, field, chunk)?;
        cache
            .peek(key)
            .map(|data| data.get(offset))
            .ok_or_else(|| evicted_error(key))
    }

    fn set_value(&mut self, row: u64, field: &str, value: FieldValue) -> TableResult<()> {
        {
            let _layout = self
                .layout_lock
                .read()
                .map_err(|_| TableError::LockPoisoned)?;
            let field = self.schema.require_typed(field, &value)?;
            check_row(row, self.row_count)?;
            self.write_run(field, row, std::slice::from_ref(&value))?;
        }
        self.maybe_flush()
    }

    fn get_neighbours(&self, start: u64, len: u64) -> TableResult<Vec<Vec<u64>>> {
        check_range(start, len, self.row_count)?;

        let mut cache = self.lock_neighbours()?;
        let mut out = Vec::with_capacity(len as usize);
        let end = start + len;
        let mut row = start;
        while row < end {
            let (chunk, offset) = self.locate(row);
            let take = (self.chunk_size - offset as u64).min(end - row) as usize;
            self.ensure_neighbours(&mut cache, chunk)?;
            let lists = cache.get(chunk).ok_or_else(|| evicted_lists_error(chunk))?;
            out.extend_from_slice(&lists[offset..offset + take]);
            row += take as u64;
        }
        Ok(out)
    }

    fn set_neighbours(&mut self, start: u64, neighbours: &[Vec<u64>]) -> TableResult<()> {
        {
            let _layout = self
                .layout_lock
                .read()
                .map_err(|_| TableError::LockPoisoned)?;
            check_range(start, neighbours.len() as u64, self.row_count)?;

            let mut cache = self.lock_neighbours()?;
            for (row, list) in (start..).zip(neighbours) {
                let (chunk, offset) = self.locate(row);
                self.ensure_neighbours(&mut cache, chunk)?;
                if !cache.set(chunk, offset, list.clone()) {
                    return Err(evicted_lists_error(chunk));
                }
            }
        }
        self.maybe_flush()
    }

    fn flush(&mut self) -> TableResult<()> {
        FileAttributeTable::flush(self)
    }

    fn get_values(&self, start: u64, len: u64, field: &str) -> TableResult<Vec<FieldValue>> {
        let field = self.schema.require(field)?;
        check_range(start, len, self.row_count)?;

        let mut cache = self.lock_cache()?;
        let mut out = Vec::with_capacity(len as usize);
        let end = start + len;
        let mut row = start;
        while row < end {
            let (chunk, offset) = self.locate(row);
            let take = (self.chunk_size - offset as u64).min(end - row) as usize;
            let key = self.ensure_loaded(&mut cache, field, chunk)?;
            let data = cache.peek(key).ok_or_else(|| evicted_error(key))?;
            out.extend((offset..offset + take).map(|i| data.get(i)));
            row += take as u64;
        }
        Ok(out)
    }

    fn set_values(&mut self, start: u64, values: &[FieldValue], field: &str) -> TableResult<()> {
        {
            let _layout = self
                .layout_lock
                .read()
                .map_err(|_| TableError::LockPoisoned)?;
            let field = check_batch(&self.schema, self.row_count, start, values, field)?;
            self.write_run(field, start, values)?;
        }
        self.maybe_flush()
    }

    fn fill_column(&mut self, field: &str, value: FieldValue) -> TableResult<()> {
        let index = self.schema.require_typed(field, &value)?.index;
        for chunk in 0..self.chunk_count() {
            {
                let _layout = self
                    .layout_lock
                    .read()
                    .map_err(|_| TableError::LockPoisoned)?;
                let data = ColumnData::filled(&value, self.chunk_len(chunk));
                self.lock_cache()?
                    .insert_dirty(ChunkKey { field: index, chunk }, data);
            }
            self.maybe_flush()?;
        }
        Ok(())
    }
}

impl Drop for FileAttributeTable {
    fn drop(&mut self) {
        if self.has_pending_changes() {
            tracing::warn!(
                band = self.band,
                fields = self.schema.len(),
                rows = self.row_count,
                "Attribute table dropped with unflushed changes, discarding them"
            );
        }
    }
}

fn evicted_error(key: ChunkKey) -> TableError {
    TableError::BackendIOFailure {
        reason: format!(
            "chunk {} of field {} left the cache while in use",
            key.chunk, key.field
        ),
    }
}

fn evicted_lists_error(chunk: u64) -> TableError {
    TableError::BackendIOFailure {
        reason: format!("neighbour chunk {chunk} left the cache while in use"),
    }
}

/// Write the field list, defaults, size marker, chunk size and generation
/// of a band's table.
fn write_layout(
    batch: &mut Batch<'_>,
    band: u32,
    schema: &FieldSchema,
    rows: u64,
    chunk_size: u64,
    generation: u64,
) -> TableResult<()> {
    batch.put_json(&layout::fields_key(band), &layout::encode_fields(schema))?;
    batch.put(&layout::defaults_key(band), &layout::encode_defaults(schema))?;
    batch.put(&layout::size_key(band), &SizeMarker::of(schema, rows).encode())?;
    batch.put(&layout::chunk_size_key(band), &chunk_size.to_le_bytes())?;
    batch.put(
        &layout::generation_key(band),
        &layout::encode_generation(generation),
    )?;
    Ok(())
}

/// Read a band's table layout, or `None` if no table is attached.
fn read_durable(container: &Container, band: u32) -> TableResult<Option<DurableState>> {
    let Some(records) = container.get_json::<Vec<layout::FieldRecord>>(&layout::fields_key(band))?
    else {
        return Ok(None);
    };
    let defaults_key = layout::defaults_key(band);
    let defaults = match container.get(&defaults_key)? {
        Some(bytes) => layout::decode_defaults(&defaults_key, &bytes)?,
        None => Vec::new(),
    };
    let schema = layout::decode_fields(records, defaults)?;

    let chunk_size_key = layout::chunk_size_key(band);
    let chunk_size = match container.get(&chunk_size_key)? {
        Some(bytes) => layout::decode_chunk_size(&chunk_size_key, &bytes)?,
        None => {
            return Err(TableError::BackendIOFailure {
                reason: format!("{chunk_size_key} is missing"),
            })
        }
    };

    let size_key = layout::size_key(band);
    let rows = match container.get(&size_key)? {
        Some(bytes) => {
            let marker = SizeMarker::decode(&size_key, &bytes)?;
            marker.check(&schema)?;
            marker.rows
        }
        None => 0,
    };

    let generation_key = layout::generation_key(band);
    let generation =
        layout::decode_generation(&generation_key, container.get(&generation_key)?.as_deref())?;

    Ok(Some(DurableState {
        schema,
        rows,
        chunk_size,
        generation,
    }))
}
