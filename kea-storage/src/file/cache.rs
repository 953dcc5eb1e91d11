//! Write-behind chunk cache.
//!
//! Holds decoded chunks of one table keyed by `(field index, chunk number)`.
//! Dirty chunks stay resident until the owning table flushes them; only clean
//! chunks are evicted, least recently used first.

use std::collections::HashMap;

use super::chunk::ColumnData;

/// Cache address of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkKey {
    pub field: usize,
    pub chunk: u64,
}

#[derive(Debug)]
struct CachedChunk {
    data: ColumnData,
    dirty: bool,
    last_used: u64,
}

/// Statistics about cache performance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that had to go to the container.
    pub misses: u64,
    /// Clean chunks dropped to stay under the chunk limit.
    pub evictions: u64,
    /// Successful flushes.
    pub flushes: u64,
    /// Chunks currently resident.
    pub chunk_count: usize,
    /// Approximate bytes held by dirty chunks.
    pub dirty_bytes: usize,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkCache {
    chunks: HashMap<ChunkKey, CachedChunk>,
    tick: u64,
    dirty_bytes: usize,
    stats: CacheStats,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a resident chunk, recording a hit or miss.
    pub fn get(&mut self, key: ChunkKey) -> Option<&ColumnData> {
        let tick = self.touch();
        match self.chunks.get_mut(&key) {
            Some(entry) => {
                self.stats.hits += 1;
                entry.last_used = tick;
                Some(&entry.data)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up a resident chunk without touching statistics or recency.
    pub fn peek(&self, key: ChunkKey) -> Option<&ColumnData> {
        self.chunks.get(&key).map(|c| &c.data)
    }

    /// Insert a chunk as loaded from the container.
    pub fn insert_clean(&mut self, key: ChunkKey, data: ColumnData) {
        let last_used = self.touch();
        if let Some(old) = self.chunks.insert(
            key,
            CachedChunk {
                data,
                dirty: false,
                last_used,
            },
        ) {
            if old.dirty {
                self.dirty_bytes = self.dirty_bytes.saturating_sub(old.data.size_bytes());
            }
        }
    }

    /// Insert or replace a chunk and mark it dirty.
    pub fn insert_dirty(&mut self, key: ChunkKey, data: ColumnData) {
        let last_used = self.touch();
        let size = data.size_bytes();
        if let Some(old) = self.chunks.insert(
            key,
            CachedChunk {
                data,
                dirty: true,
                last_used,
            },
        ) {
            if old.dirty {
                self.dirty_bytes = self.dirty_bytes.saturating_sub(old.data.size_bytes());
            }
        }
        self.dirty_bytes += size;
    }

    /// Mutable access to a resident chunk, marking it dirty.
    ///
    /// `extra_bytes` is added to the dirty total when the chunk was already
    /// dirty, so string payload growth counts toward the flush threshold.
    pub fn get_mut_dirty(&mut self, key: ChunkKey, extra_bytes: usize) -> Option<&mut ColumnData> {
        let tick = self.touch();
        let entry = self.chunks.get_mut(&key)?;
        entry.last_used = tick;
        if entry.dirty {
            self.dirty_bytes += extra_bytes;
        } else {
            entry.dirty = true;
            self.dirty_bytes += entry.data.size_bytes();
        }
        Some(&mut entry.data)
    }

    /// Pad a resident chunk to `len` rows without changing its dirty state.
    pub fn pad(&mut self, key: ChunkKey, len: usize, default: &kea_core::FieldValue) {
        if let Some(entry) = self.chunks.get_mut(&key) {
            entry.data.pad_to(len, default);
        }
    }

    pub fn has_dirty(&self) -> bool {
        self.chunks.values().any(|c| c.dirty)
    }

    pub fn dirty_bytes(&self) -> usize {
        self.dirty_bytes
    }

    /// Dirty chunks in key order.
    pub fn dirty_chunks(&self) -> Vec<(ChunkKey, &ColumnData)> {
        let mut dirty: Vec<_> = self
            .chunks
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(k, c)| (*k, &c.data))
            .collect();
        dirty.sort_by_key(|(k, _)| *k);
        dirty
    }

    /// Record a successful flush: every chunk becomes clean.
    pub fn mark_flushed(&mut self) {
        for chunk in self.chunks.values_mut() {
            chunk.dirty = false;
        }
        self.dirty_bytes = 0;
        self.stats.flushes += 1;
    }

    /// Evict least recently used clean chunks until at most `max_chunks`
    /// remain. Returns the number evicted.
    pub fn evict_clean(&mut self, max_chunks: usize) -> usize {
        if self.chunks.len() <= max_chunks {
            return 0;
        }
        let mut clean: Vec<(u64, ChunkKey)> = self
            .chunks
            .iter()
            .filter(|(_, c)| !c.dirty)
            .map(|(k, c)| (c.last_used, *k))
            .collect();
        clean.sort_unstable();

        let excess = self.chunks.len() - max_chunks;
        let mut evicted = 0;
        for (_, key) in clean.into_iter().take(excess) {
            self.chunks.remove(&key);
            evicted += 1;
        }
        self.stats.evictions += evicted as u64;
        evicted
    }

    /// Drop everything, dirty chunks included.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.dirty_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            chunk_count: self.chunks.len(),
            dirty_bytes: self.dirty_bytes,
            ..self.stats.clone()
        }
    }
}
