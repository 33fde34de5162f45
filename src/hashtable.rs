//! Chained hash index mapping key bytes to item chunks.
//!
//! The table is sized to a power of two at construction and never resizes.
//! Each bucket is a short chain of entries carrying the full 64-bit hash,
//! so most non-matching entries are rejected without touching chunk memory.
//! Key uniqueness is the item layer's responsibility: a key is always
//! unlinked before a replacement is inserted.

use std::hash::BuildHasher;
use std::ptr::NonNull;

use ahash::RandomState;

use crate::item::ItemHeader;

struct Entry {
    hash: u64,
    item: NonNull<ItemHeader>,
}

pub(crate) struct HashTable {
    buckets: Box<[Vec<Entry>]>,
    mask: u64,
    hash_builder: RandomState,
}

impl HashTable {
    /// Create a table with 2^power buckets.
    pub(crate) fn new(power: u8) -> Self {
        debug_assert!((1..=32).contains(&power));

        // Fixed seeds in tests for deterministic bucket placement.
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let nbuckets = 1usize << power;
        let buckets = (0..nbuckets).map(|_| Vec::new()).collect();

        Self {
            buckets,
            mask: nbuckets as u64 - 1,
            hash_builder,
        }
    }

    #[inline]
    fn index(&self, hash: u64) -> usize {
        (hash & self.mask) as usize
    }

    /// Look up the item linked under `key`.
    pub(crate) fn get(&self, key: &[u8]) -> Option<NonNull<ItemHeader>> {
        let hash = self.hash_builder.hash_one(key);
        self.buckets[self.index(hash)]
            .iter()
            .find(|entry| entry.hash == hash && unsafe { entry.item.as_ref().key() } == key)
            .map(|entry| entry.item)
    }

    /// Insert an item under `key`. The key must not already be present.
    pub(crate) fn put(&mut self, key: &[u8], item: NonNull<ItemHeader>) {
        debug_assert!(self.get(key).is_none());

        let hash = self.hash_builder.hash_one(key);
        let index = self.index(hash);
        self.buckets[index].push(Entry { hash, item });
    }

    /// Remove the entry for `key`, if present.
    pub(crate) fn delete(&mut self, key: &[u8]) -> bool {
        let hash = self.hash_builder.hash_one(key);
        let bucket = &mut self.buckets[self.index(hash)];

        let position = bucket
            .iter()
            .position(|entry| entry.hash == hash && unsafe { entry.item.as_ref().key() } == key);

        match position {
            Some(index) => {
                bucket.swap_remove(index);
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::ITEM_HDR_SIZE;

    // Chunk-shaped buffers holding just a header and a key, enough for the
    // table to read keys back out.
    #[repr(align(8))]
    struct Chunk([u8; 64]);

    impl Chunk {
        fn with_key(key: &[u8]) -> Self {
            let mut chunk = Chunk([0; 64]);
            let ptr = chunk.0.as_mut_ptr() as *mut ItemHeader;
            unsafe {
                ItemHeader::init_chunk(ptr, 0, 0);
                (*ptr).reset(key.len() as u8, 0, 0, false);
                std::ptr::copy_nonoverlapping(
                    key.as_ptr(),
                    chunk.0.as_mut_ptr().add(ITEM_HDR_SIZE),
                    key.len(),
                );
            }
            chunk
        }

        fn item(&mut self) -> NonNull<ItemHeader> {
            NonNull::new(self.0.as_mut_ptr() as *mut ItemHeader).unwrap()
        }
    }

    #[test]
    fn test_put_get_delete() {
        let mut table = HashTable::new(4);
        let mut a = Chunk::with_key(b"alpha");
        let mut b = Chunk::with_key(b"beta");

        table.put(b"alpha", a.item());
        table.put(b"beta", b.item());

        assert_eq!(table.get(b"alpha"), Some(a.item()));
        assert_eq!(table.get(b"beta"), Some(b.item()));
        assert_eq!(table.get(b"gamma"), None);
        assert_eq!(table.len(), 2);

        assert!(table.delete(b"alpha"));
        assert_eq!(table.get(b"alpha"), None);
        assert!(!table.delete(b"alpha"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_collisions_resolved_by_chaining() {
        // A tiny table forces every key into a handful of buckets.
        let mut table = HashTable::new(1);
        let keys: Vec<Vec<u8>> = (0..16).map(|i| format!("key_{i}").into_bytes()).collect();
        let mut chunks: Vec<Chunk> = keys.iter().map(|k| Chunk::with_key(k)).collect();

        for (key, chunk) in keys.iter().zip(chunks.iter_mut()) {
            table.put(key, chunk.item());
        }

        for (key, chunk) in keys.iter().zip(chunks.iter_mut()) {
            assert_eq!(table.get(key), Some(chunk.item()));
        }

        for key in &keys {
            assert!(table.delete(key));
        }
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_delete_miss_on_empty() {
        let mut table = HashTable::new(4);
        assert!(!table.delete(b"nothing"));
        assert_eq!(table.get(b"nothing"), None);
    }
}
