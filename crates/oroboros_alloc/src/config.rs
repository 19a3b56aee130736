//! # Allocator Configuration
//!
//! Construction-time parameters for the small object allocator.
//! Loaded once at startup from TOML, validated before any bucket is built.
//!
//! ```toml
//! page_size = 4096
//! max_object_size = 2048
//! object_align_size = 4
//! memory_limit = 67108864
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AllocError, AllocResult};

/// Default bytes per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Default threshold between small and large objects.
pub const MAX_SMALL_OBJECT_SIZE: usize = 2048;

/// Default bucket granularity.
pub const DEFAULT_OBJECT_ALIGNMENT: usize = 4;

/// Largest block size any configuration may ask the buckets to serve.
pub const MAX_BLOCK_SIZE_LIMIT: usize = 64 * 1024;

/// Configuration for a [`SmallObjectAllocator`](crate::SmallObjectAllocator).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Target bytes per chunk. The block count per chunk is derived from it
    /// and clamped to `[8, 255]`.
    pub page_size: usize,
    /// Largest request served from the buckets. Larger requests go to the
    /// system allocator.
    pub max_object_size: usize,
    /// Bucket granularity. Must be a power of two.
    pub object_align_size: usize,
    /// Upper bound on bytes held in chunk buffers across all buckets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<usize>,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_CHUNK_SIZE,
            max_object_size: MAX_SMALL_OBJECT_SIZE,
            object_align_size: DEFAULT_OBJECT_ALIGNMENT,
            memory_limit: None,
        }
    }
}

impl AllocatorConfig {
    /// Preset for particle-heavy scenes: few size classes, big chunks.
    #[must_use]
    pub const fn particles() -> Self {
        Self {
            page_size: 16 * 1024,
            max_object_size: 256,
            object_align_size: 16,
            memory_limit: None,
        }
    }

    /// Parses and validates a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] on malformed TOML or on
    /// parameters rejected by [`validate`](Self::validate).
    pub fn from_toml_str(text: &str) -> AllocResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| AllocError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if the file cannot be read or
    /// does not hold a valid configuration.
    pub fn from_toml_file(path: impl AsRef<Path>) -> AllocResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| AllocError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serializes the configuration back to TOML.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] if serialization fails.
    pub fn to_toml_string(&self) -> AllocResult<String> {
        toml::to_string(self).map_err(|e| AllocError::InvalidConfig(e.to_string()))
    }

    /// Checks every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError::InvalidConfig`] naming the first bad parameter.
    pub fn validate(&self) -> AllocResult<()> {
        if self.object_align_size == 0 {
            return Err(AllocError::InvalidConfig(
                "object_align_size must be non-zero".into(),
            ));
        }
        if !self.object_align_size.is_power_of_two() {
            return Err(AllocError::InvalidConfig(format!(
                "object_align_size must be a power of two, got {}",
                self.object_align_size
            )));
        }
        if self.max_object_size == 0 {
            return Err(AllocError::InvalidConfig(
                "max_object_size must be non-zero".into(),
            ));
        }
        let largest_block = self
            .bucket_count()
            .checked_mul(self.object_align_size)
            .filter(|&block| block <= MAX_BLOCK_SIZE_LIMIT)
            .ok_or_else(|| {
                AllocError::InvalidConfig(format!(
                    "largest block for max_object_size {} at object_align_size {} \
                     exceeds {MAX_BLOCK_SIZE_LIMIT} bytes",
                    self.max_object_size, self.object_align_size
                ))
            })?;
        if self.page_size < largest_block {
            return Err(AllocError::InvalidConfig(format!(
                "page_size {} is smaller than the largest block size {largest_block}",
                self.page_size
            )));
        }
        Ok(())
    }

    /// Number of size buckets: `ceil(max_object_size / object_align_size)`.
    #[inline]
    #[must_use]
    pub const fn bucket_count(&self) -> usize {
        get_offset(self.max_object_size, self.object_align_size)
    }
}

/// `ceil(num_bytes / alignment)`.
///
/// `alignment` must be non-zero.
#[inline]
#[must_use]
pub const fn get_offset(num_bytes: usize, alignment: usize) -> usize {
    num_bytes.div_ceil(alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AllocatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bucket_count(), 512);
        AllocatorConfig::particles().validate().unwrap();
    }

    #[test]
    fn test_get_offset() {
        assert_eq!(get_offset(1, 4), 1);
        assert_eq!(get_offset(4, 4), 1);
        assert_eq!(get_offset(5, 4), 2);
        assert_eq!(get_offset(10, 4), 3);
        assert_eq!(get_offset(2048, 4), 512);
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let zero_align = AllocatorConfig {
            object_align_size: 0,
            ..AllocatorConfig::default()
        };
        assert!(matches!(
            zero_align.validate(),
            Err(AllocError::InvalidConfig(_))
        ));

        let odd_align = AllocatorConfig {
            object_align_size: 6,
            ..AllocatorConfig::default()
        };
        assert!(odd_align.validate().is_err());

        let small_page = AllocatorConfig {
            page_size: 1024,
            ..AllocatorConfig::default()
        };
        assert!(small_page.validate().is_err());

        let no_buckets = AllocatorConfig {
            max_object_size: 0,
            ..AllocatorConfig::default()
        };
        assert!(no_buckets.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_blocks() {
        let huge = AllocatorConfig {
            page_size: usize::MAX / 2,
            max_object_size: usize::MAX / 2,
            object_align_size: 1,
            memory_limit: None,
        };
        assert!(matches!(huge.validate(), Err(AllocError::InvalidConfig(_))));

        let huge_align = AllocatorConfig {
            page_size: usize::MAX,
            max_object_size: 1,
            object_align_size: 1 << (usize::BITS - 1),
            memory_limit: None,
        };
        assert!(huge_align.validate().is_err());

        let at_limit = AllocatorConfig {
            page_size: MAX_BLOCK_SIZE_LIMIT,
            max_object_size: MAX_BLOCK_SIZE_LIMIT,
            object_align_size: 1024,
            memory_limit: None,
        };
        at_limit.validate().unwrap();
        let past_limit = AllocatorConfig {
            max_object_size: MAX_BLOCK_SIZE_LIMIT + 1,
            page_size: 2 * MAX_BLOCK_SIZE_LIMIT,
            ..at_limit
        };
        assert!(past_limit.validate().is_err());
    }

    #[test]
    fn test_toml_rejects_oversized_blocks() {
        let text = "page_size = 9223372036854775807\n\
                    max_object_size = 9223372036854775807\n\
                    object_align_size = 1\n";
        assert!(matches!(
            AllocatorConfig::from_toml_str(text),
            Err(AllocError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_toml_partial_uses_defaults() {
        let config = AllocatorConfig::from_toml_str("max_object_size = 256\n").unwrap();
        assert_eq!(config.max_object_size, 256);
        assert_eq!(config.page_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.object_align_size, DEFAULT_OBJECT_ALIGNMENT);
        assert_eq!(config.memory_limit, None);
    }

    #[test]
    fn test_toml_rejects_unknown_and_invalid() {
        assert!(AllocatorConfig::from_toml_str("page_sise = 4096\n").is_err());
        assert!(AllocatorConfig::from_toml_str("object_align_size = 3\n").is_err());
    }

    #[test]
    fn test_toml_file_roundtrip() {
        let config = AllocatorConfig {
            memory_limit: Some(1 << 20),
            ..AllocatorConfig::particles()
        };
        let path = std::env::temp_dir().join(format!(
            "oroboros_alloc_config_{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = AllocatorConfig::from_toml_file(&path).unwrap();
        assert_eq!(loaded, config);

        std::fs::remove_file(&path).ok();
        assert!(AllocatorConfig::from_toml_file(&path).is_err());
    }
}
