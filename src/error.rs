//! Error types for store operations.

use std::fmt;

/// Errors returned by item operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemError {
    /// Key not present (for get-like, cas, append/prepend, delete).
    NotFound,

    /// The item does not fit in the largest slab class.
    Oversized,

    /// Chunk allocation failed: no free chunk and no evictable slab.
    NoMem,

    /// CAS value mismatch - the item was modified since last read.
    CasMismatch,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "key not found"),
            Self::Oversized => write!(f, "item exceeds largest slab class"),
            Self::NoMem => write!(f, "no memory available for item"),
            Self::CasMismatch => write!(f, "cas value mismatch"),
        }
    }
}

impl std::error::Error for ItemError {}

/// Result type for item operations.
pub type ItemResult<T> = Result<T, ItemError>;

/// Errors detected while validating a [`StoreConfig`](crate::StoreConfig)
/// or building a store from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Slab size is zero, unaligned, or does not fit a 32-bit offset.
    InvalidSlabSize,

    /// Minimum chunk size cannot hold an item header or exceeds the slab size.
    InvalidMinChunkSize,

    /// Growth factor must be greater than 1.0.
    InvalidGrowthFactor,

    /// Hash power must be between 1 and 32.
    InvalidHashPower,

    /// Heap is smaller than a single slab.
    HeapTooSmall,

    /// The chunk size ladder exceeds the maximum class count.
    TooManyClasses,

    /// The heap allocation was refused by the allocator.
    AllocationFailed,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSlabSize => write!(f, "invalid slab size"),
            Self::InvalidMinChunkSize => write!(f, "invalid minimum chunk size"),
            Self::InvalidGrowthFactor => write!(f, "growth factor must be > 1.0"),
            Self::InvalidHashPower => write!(f, "hash power must be in 1..=32"),
            Self::HeapTooSmall => write!(f, "heap smaller than one slab"),
            Self::TooManyClasses => write!(f, "too many slab classes"),
            Self::AllocationFailed => write!(f, "heap allocation failed"),
        }
    }
}

impl std::error::Error for ConfigError {}
