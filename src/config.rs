//! Store configuration and slab class sizing.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::item::ITEM_HDR_SIZE;

/// Default heap size (64MB).
pub const DEFAULT_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Default slab size (1MB).
pub const DEFAULT_SLAB_SIZE: usize = 1024 * 1024;

/// Default hash power (2^16 = 64K buckets).
pub const DEFAULT_HASH_POWER: u8 = 16;

/// Default smallest chunk size.
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 64;

/// Default growth factor between adjacent chunk classes (~20% worst-case
/// internal fragmentation).
pub const DEFAULT_GROWTH_FACTOR: f64 = 1.25;

/// Chunk starts are aligned so header field access is well-defined.
pub(crate) const CHUNK_ALIGN: usize = 8;

/// Class ids are a u8, with one value reserved as invalid.
const MAX_CLASSES: usize = 255;

/// Round `size` up to the chunk alignment.
#[inline]
pub(crate) fn align_size(size: usize) -> usize {
    (size + CHUNK_ALIGN - 1) & !(CHUNK_ALIGN - 1)
}

/// Slab eviction policy applied when a class has no free chunk and the heap
/// is fully carved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Never evict; allocation fails when memory is exhausted.
    None,
    /// Evict the least recently created slab of the class, provided no item
    /// in it is pinned.
    #[default]
    Lrc,
}

/// Item store configuration.
///
/// All fields have defaults, so a store can be built from an empty TOML
/// table or via [`StoreConfig::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Total heap size in bytes; rounded down to a whole number of slabs.
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// Slab size in bytes. Also the largest chunk size, which bounds the
    /// largest storable item.
    #[serde(default = "default_slab_size")]
    pub slab_size: usize,

    /// The hash index is sized to 2^hash_power buckets at build time.
    #[serde(default = "default_hash_power")]
    pub hash_power: u8,

    /// When true, items embed an 8-byte CAS value stamped at link time.
    /// When false, all CAS values read as zero.
    #[serde(default = "default_use_cas")]
    pub use_cas: bool,

    /// Smallest chunk size in the class ladder.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Multiplier between adjacent chunk classes. Must be greater than 1.0.
    #[serde(default = "default_growth_factor")]
    pub growth_factor: f64,

    /// Slab eviction policy.
    #[serde(default)]
    pub eviction: EvictionPolicy,
}

fn default_heap_size() -> usize {
    DEFAULT_HEAP_SIZE
}

fn default_slab_size() -> usize {
    DEFAULT_SLAB_SIZE
}

fn default_hash_power() -> u8 {
    DEFAULT_HASH_POWER
}

fn default_use_cas() -> bool {
    true
}

fn default_min_chunk_size() -> usize {
    DEFAULT_MIN_CHUNK_SIZE
}

fn default_growth_factor() -> f64 {
    DEFAULT_GROWTH_FACTOR
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            heap_size: DEFAULT_HEAP_SIZE,
            slab_size: DEFAULT_SLAB_SIZE,
            hash_power: DEFAULT_HASH_POWER,
            use_cas: true,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            eviction: EvictionPolicy::default(),
        }
    }
}

impl StoreConfig {
    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slab_size == 0
            || self.slab_size % CHUNK_ALIGN != 0
            || self.slab_size > u32::MAX as usize
        {
            return Err(ConfigError::InvalidSlabSize);
        }
        if self.min_chunk_size < align_size(ITEM_HDR_SIZE + CHUNK_ALIGN)
            || self.min_chunk_size > self.slab_size
        {
            return Err(ConfigError::InvalidMinChunkSize);
        }
        if !(self.growth_factor > 1.0) {
            return Err(ConfigError::InvalidGrowthFactor);
        }
        if self.hash_power == 0 || self.hash_power > 32 {
            return Err(ConfigError::InvalidHashPower);
        }
        if self.heap_size < self.slab_size {
            return Err(ConfigError::HeapTooSmall);
        }
        // Confirms the ladder fits the class id space.
        self.chunk_sizes().map(|_| ())
    }

    /// Generate the chunk size ladder for this configuration.
    ///
    /// Sizes start at `min_chunk_size`, grow by `growth_factor` (rounded up
    /// to the chunk alignment), and end with `slab_size` as the final class.
    pub(crate) fn chunk_sizes(&self) -> Result<Vec<usize>, ConfigError> {
        let mut sizes = Vec::new();
        let mut size = align_size(self.min_chunk_size);

        while size < self.slab_size {
            sizes.push(size);
            let next = align_size((size as f64 * self.growth_factor) as usize);
            size = next.max(size + CHUNK_ALIGN);
        }
        sizes.push(self.slab_size);

        if sizes.len() > MAX_CLASSES {
            return Err(ConfigError::TooManyClasses);
        }
        Ok(sizes)
    }

    /// Number of slabs the heap can hold.
    pub(crate) fn slab_count(&self) -> usize {
        self.heap_size / self.slab_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.slab_count(), 64);
    }

    #[test]
    fn test_chunk_sizes_shape() {
        let config = StoreConfig::default();
        let sizes = config.chunk_sizes().unwrap();

        assert_eq!(sizes[0], DEFAULT_MIN_CHUNK_SIZE);
        assert_eq!(*sizes.last().unwrap(), DEFAULT_SLAB_SIZE);

        for window in sizes.windows(2) {
            assert!(window[0] < window[1]);
            assert_eq!(window[0] % CHUNK_ALIGN, 0);
        }
    }

    #[test]
    fn test_chunk_sizes_growth() {
        let config = StoreConfig::default();
        let sizes = config.chunk_sizes().unwrap();

        // Adjacent classes stay near the configured factor, apart from the
        // jump into the final slab-sized class.
        for window in sizes[..sizes.len() - 1].windows(2) {
            let ratio = window[1] as f64 / window[0] as f64;
            assert!(
                (1.0..=1.4).contains(&ratio),
                "{} -> {}: ratio {:.3}",
                window[0],
                window[1],
                ratio
            );
        }
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = StoreConfig {
            slab_size: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidSlabSize));

        config = StoreConfig {
            min_chunk_size: 8,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMinChunkSize));

        config = StoreConfig {
            growth_factor: 1.0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidGrowthFactor));

        config = StoreConfig {
            hash_power: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidHashPower));

        config = StoreConfig {
            heap_size: 1024,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::HeapTooSmall));
    }

    #[test]
    fn test_deserialize_from_toml() {
        let config: StoreConfig = toml::from_str(
            r#"
            heap_size = 4194304
            slab_size = 65536
            hash_power = 10
            use_cas = false
            eviction = "none"
            "#,
        )
        .unwrap();

        assert_eq!(config.heap_size, 4 * 1024 * 1024);
        assert_eq!(config.slab_size, 64 * 1024);
        assert_eq!(config.hash_power, 10);
        assert!(!config.use_cas);
        assert_eq!(config.eviction, EvictionPolicy::None);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.min_chunk_size, DEFAULT_MIN_CHUNK_SIZE);
    }

    #[test]
    fn test_deserialize_rejects_unknown_fields() {
        let result: Result<StoreConfig, _> = toml::from_str("chunk_count = 4");
        assert!(result.is_err());
    }
}
