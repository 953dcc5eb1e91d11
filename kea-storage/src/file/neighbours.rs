//! Per-row neighbour lists.
//!
//! Neighbours of the rows in one chunk are stored under a single key: a
//! u64 LE row count, then for each row a u64 LE list length followed by
//! that many u64 LE row ids. Rows never written have no neighbours.

use std::collections::HashMap;

use crate::container::ContainerError;

pub fn encode(lists: &[Vec<u64>]) -> Vec<u8> {
    let words = 1 + lists.iter().map(|l| 1 + l.len()).sum::<usize>();
    let mut out = Vec::with_capacity(words * 8);
    out.extend_from_slice(&(lists.len() as u64).to_le_bytes());
    for list in lists {
        out.extend_from_slice(&(list.len() as u64).to_le_bytes());
        for id in list {
            out.extend_from_slice(&id.to_le_bytes());
        }
    }
    out
}

pub fn decode(key: &str, bytes: &[u8]) -> Result<Vec<Vec<u64>>, ContainerError> {
    let corrupt = |reason: String| ContainerError::Corrupt {
        key: key.to_string(),
        reason,
    };
    if bytes.len() % 8 != 0 {
        return Err(corrupt(format!(
            "length {} is not a multiple of 8",
            bytes.len()
        )));
    }
    let mut words = bytes.chunks_exact(8).map(|w| {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(w);
        u64::from_le_bytes(buf)
    });
    let mut next = || words.next().ok_or_else(|| corrupt("truncated".to_string()));

    let rows = next()?;
    let mut lists = Vec::new();
    for _ in 0..rows {
        let len = next()?;
        let list = (0..len).map(|_| next()).collect::<Result<Vec<_>, _>>()?;
        lists.push(list);
    }
    Ok(lists)
}

/// Approximate resident size of a run of lists.
fn size_bytes(lists: &[Vec<u64>]) -> usize {
    lists.iter().map(|l| (1 + l.len()) * 8).sum()
}

#[derive(Debug)]
struct CachedLists {
    lists: Vec<Vec<u64>>,
    dirty: bool,
}

/// Write-behind cache of neighbour chunks, keyed by chunk number.
///
/// Dirty chunks stay resident until flushed; clean ones are dropped once
/// the cache is full.
#[derive(Debug, Default)]
pub struct NeighbourCache {
    chunks: HashMap<u64, CachedLists>,
    dirty_bytes: usize,
}

impl NeighbourCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, chunk: u64) -> Option<&[Vec<u64>]> {
        self.chunks.get(&chunk).map(|c| c.lists.as_slice())
    }

    /// Insert a chunk as loaded, first dropping clean chunks so that at
    /// most `max_chunks` are resident afterwards.
    pub fn insert_clean(&mut self, chunk: u64, lists: Vec<Vec<u64>>, max_chunks: usize) {
        if self.chunks.len() >= max_chunks {
            let limit = max_chunks.saturating_sub(1);
            let clean: Vec<u64> = self
                .chunks
                .iter()
                .filter(|(_, c)| !c.dirty)
                .map(|(k, _)| *k)
                .take(self.chunks.len().saturating_sub(limit))
                .collect();
            for key in clean {
                self.chunks.remove(&key);
            }
        }
        self.chunks.insert(chunk, CachedLists { lists, dirty: false });
    }

    /// Extend a resident chunk to `len` rows with empty lists.
    pub fn pad(&mut self, chunk: u64, len: usize) {
        if let Some(entry) = self.chunks.get_mut(&chunk) {
            if entry.lists.len() < len {
                entry.lists.resize(len, Vec::new());
            }
        }
    }

    /// Replace the list at `offset` of a resident chunk and mark it dirty.
    /// Returns false if the chunk is not resident.
    pub fn set(&mut self, chunk: u64, offset: usize, list: Vec<u64>) -> bool {
        let Some(entry) = self.chunks.get_mut(&chunk) else {
            return false;
        };
        let added = (1 + list.len()) * 8;
        entry.lists[offset] = list;
        if entry.dirty {
            self.dirty_bytes += added;
        } else {
            entry.dirty = true;
            self.dirty_bytes += size_bytes(&entry.lists);
        }
        true
    }

    pub fn has_dirty(&self) -> bool {
        self.chunks.values().any(|c| c.dirty)
    }

    pub fn dirty_bytes(&self) -> usize {
        self.dirty_bytes
    }

    /// Dirty chunks in chunk order.
    pub fn dirty_chunks(&self) -> Vec<(u64, &[Vec<u64>])> {
        let mut dirty: Vec<_> = self
            .chunks
            .iter()
            .filter(|(_, c)| c.dirty)
            .map(|(k, c)| (*k, c.lists.as_slice()))
            .collect();
        dirty.sort_by_key(|(k, _)| *k);
        dirty
    }

    pub fn mark_flushed(&mut self) {
        for entry in self.chunks.values_mut() {
            entry.dirty = false;
        }
        self.dirty_bytes = 0;
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.dirty_bytes = 0;
    }
}
