//! Configuration types

use crate::{ConfigError, KeaResult};
use serde::{Deserialize, Serialize};

/// Rows per attribute column chunk when none is configured.
pub const DEFAULT_ATT_CHUNK_SIZE: u64 = 1000;

/// Pixel block edge length when none is configured.
pub const DEFAULT_IMAGE_BLOCK_SIZE: u32 = 256;

/// Master configuration for containers and persistent tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeaConfig {
    /// Rows per column chunk for newly attached attribute tables.
    pub attribute_chunk_size: u64,
    /// Edge length of the square pixel blocks of new bands.
    pub image_block_size: u32,
    /// Dirty cache bytes that trigger an automatic flush.
    pub cache_flush_threshold_bytes: usize,
    /// Chunks kept in a table's cache before clean ones are evicted.
    pub cache_max_chunks: usize,
    /// LMDB map size in megabytes.
    pub map_size_mb: usize,
}

impl Default for KeaConfig {
    fn default() -> Self {
        Self {
            attribute_chunk_size: DEFAULT_ATT_CHUNK_SIZE,
            image_block_size: DEFAULT_IMAGE_BLOCK_SIZE,
            cache_flush_threshold_bytes: 4 * 1024 * 1024,
            cache_max_chunks: 256,
            map_size_mb: 1024,
        }
    }
}

impl KeaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; omitted keys keep their defaults.
    pub fn from_toml_str(input: &str) -> KeaResult<Self> {
        let config: KeaConfig = toml::from_str(input).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_attribute_chunk_size(mut self, rows: u64) -> Self {
        self.attribute_chunk_size = rows;
        self
    }

    pub fn with_image_block_size(mut self, size: u32) -> Self {
        self.image_block_size = size;
        self
    }

    pub fn with_cache_flush_threshold(mut self, bytes: usize) -> Self {
        self.cache_flush_threshold_bytes = bytes;
        self
    }

    pub fn with_cache_max_chunks(mut self, chunks: usize) -> Self {
        self.cache_max_chunks = chunks;
        self
    }

    pub fn with_map_size_mb(mut self, mb: usize) -> Self {
        self.map_size_mb = mb;
        self
    }

    /// Validate the configuration.
    ///
    /// Every size must be positive.
    pub fn validate(&self) -> KeaResult<()> {
        if self.attribute_chunk_size == 0 {
            return Err(invalid("attribute_chunk_size", self.attribute_chunk_size, "must be positive"));
        }
        if self.image_block_size == 0 {
            return Err(invalid("image_block_size", self.image_block_size, "must be positive"));
        }
        if self.cache_flush_threshold_bytes == 0 {
            return Err(invalid(
                "cache_flush_threshold_bytes",
                self.cache_flush_threshold_bytes,
                "must be positive",
            ));
        }
        if self.cache_max_chunks == 0 {
            return Err(invalid("cache_max_chunks", self.cache_max_chunks, "must be positive"));
        }
        if self.map_size_mb == 0 {
            return Err(invalid("map_size_mb", self.map_size_mb, "must be positive"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> crate::KeaError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeaError;

    #[test]
    fn test_default_is_valid() {
        assert!(KeaConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let config = KeaConfig::new().with_attribute_chunk_size(0);
        let err = config.validate().unwrap_err();
        match err {
            KeaError::Config(ConfigError::InvalidValue { field, .. }) => {
                assert_eq!(field, "attribute_chunk_size")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_from_toml_partial() {
        let config = KeaConfig::from_toml_str(
            r#"
attribute_chunk_size = 50
cache_max_chunks = 8
"#,
        )
        .unwrap();
        assert_eq!(config.attribute_chunk_size, 50);
        assert_eq!(config.cache_max_chunks, 8);
        assert_eq!(config.image_block_size, DEFAULT_IMAGE_BLOCK_SIZE);
    }

    #[test]
    fn test_from_toml_rejects_unknown_key() {
        let err = KeaConfig::from_toml_str("chunk = 5").unwrap_err();
        assert!(matches!(err, KeaError::Config(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_from_toml_validates() {
        let err = KeaConfig::from_toml_str("map_size_mb = 0").unwrap_err();
        assert!(matches!(err, KeaError::Config(ConfigError::InvalidValue { .. })));
    }
}
