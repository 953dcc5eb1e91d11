//! Persistent attribute table backend.
//!
//! Column chunks and neighbour lists live in the container under
//! `/BAND{n}/ATT/...`; write-behind caches buffer them between flushes.

pub(crate) mod cache;
pub(crate) mod chunk;
pub(crate) mod neighbours;
mod table;

pub use cache::CacheStats;
pub use table::FileAttributeTable;
