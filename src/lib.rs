//! Slab-backed in-memory item store.
//!
//! This crate is the storage engine of a memcached-style cache server: a
//! key/value store with per-item expiry, optimistic concurrency (CAS), and
//! in-place append/prepend, built on a slab allocator that partitions a
//! fixed heap into chunk-size classes.
//!
//! # Architecture
//!
//! ```text
//! +------------------------------------------+
//! |                ItemStore                 |
//! |                                          |
//! |  +------------------------------------+  |
//! |  | HashTable                          |  |
//! |  | - key bytes -> item chunk          |  |
//! |  +------------------------------------+  |
//! |        |                                 |
//! |        v                                 |
//! |  +------------------------------------+  |
//! |  | SlabPool                           |  |
//! |  | +--------------------------------+ |  |
//! |  | | class 0 (64B chunks)  free list| |  |
//! |  | +--------------------------------+ |  |
//! |  | | class 1 (80B chunks)  free list| |  |
//! |  | +--------------------------------+ |  |
//! |  | | ...                            | |  |
//! |  | +--------------------------------+ |  |
//! |  +------------------------------------+  |
//! +------------------------------------------+
//! ```
//!
//! Two orthogonal pieces of state govern a chunk's fate: the linkage flag,
//! owned by the hash index, and the refcount, owned by callers holding
//! [`ItemGuard`] handles. A chunk returns to its class free list only when
//! it is unlinked and the last handle drops, so readers keep their view of
//! an item even after it is replaced or deleted.
//!
//! The store is single-threaded cooperative: operations run to completion
//! between I/O suspensions and there is no internal locking. The type is
//! deliberately neither `Send` nor `Sync`; a multi-threaded embedding wraps
//! the store in its own mutex or shards by key hash.
//!
//! # Example
//!
//! ```
//! use itemstore::ItemStore;
//!
//! let store = ItemStore::builder()
//!     .heap_size(4 * 1024 * 1024)
//!     .slab_size(64 * 1024)
//!     .hash_power(10)
//!     .build()
//!     .unwrap();
//!
//! store.set(b"key", b"value", 0).unwrap();
//! let item = store.get(b"key").unwrap();
//! assert_eq!(item.value(), b"value");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod class;
mod config;
mod error;
mod hashtable;
mod item;
pub mod metrics;
pub mod numeric;
pub mod time;

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use tracing::{debug, info, trace, warn};

pub use class::ClassStats;
pub use config::{
    EvictionPolicy, StoreConfig, DEFAULT_GROWTH_FACTOR, DEFAULT_HASH_POWER, DEFAULT_HEAP_SIZE,
    DEFAULT_MIN_CHUNK_SIZE, DEFAULT_SLAB_SIZE,
};
pub use error::{ConfigError, ItemError, ItemResult};
pub use item::{ItemGuard, ValueType};

use class::SlabPool;
use hashtable::HashTable;
use item::{item_ntotal, ItemHeader, ITEM_HDR_SIZE, KEY_MAX_LEN};
use metrics::{
    ITEM_CURR, ITEM_KEYVAL_BYTE, ITEM_LINK, ITEM_REMOVE, ITEM_REQ, ITEM_REQ_EX, ITEM_UNLINK,
    ITEM_VAL_BYTE,
};

/// Slab-backed item store.
///
/// Construction initializes the hash index and heap; dropping the store
/// tears both down. All operations take `&self`; interior mutability is
/// single-threaded (`Cell`/`RefCell`).
pub struct ItemStore {
    pub(crate) pool: SlabPool,
    table: RefCell<HashTable>,
    cas_counter: Cell<u64>,
    use_cas: bool,
}

impl ItemStore {
    /// Create a builder with default settings.
    pub fn builder() -> ItemStoreBuilder {
        ItemStoreBuilder::default()
    }

    /// Create a store from a configuration.
    pub fn new(config: &StoreConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = SlabPool::new(config)?;
        let table = HashTable::new(config.hash_power);

        info!(
            heap_size = config.heap_size,
            slab_size = config.slab_size,
            classes = pool.nclasses(),
            hash_power = config.hash_power,
            use_cas = config.use_cas,
            "item store initialized"
        );

        Ok(Self {
            pool,
            table: RefCell::new(table),
            cas_counter: Cell::new(0),
            use_cas: config.use_cas,
        })
    }

    /// Allocate an unlinked item for `key` with room for a `vlen`-byte
    /// value.
    ///
    /// The returned handle owns one refcount; if the item is never stored
    /// through a write operation, dropping the handle returns the chunk to
    /// its slab. The value area is uninitialized until written through
    /// [`ItemStore::update`].
    pub fn alloc(&self, key: &[u8], exptime: u32, vlen: usize) -> ItemResult<ItemGuard<'_>> {
        if key.len() > KEY_MAX_LEN {
            return Err(ItemError::Oversized);
        }
        let ntotal = item_ntotal(key.len(), vlen, self.use_cas);
        let class_id = self
            .pool
            .class_for_size(ntotal)
            .ok_or(ItemError::Oversized)?;

        let Some(chunk) = self.take_chunk(class_id) else {
            warn!(class = class_id, "item allocation failed");
            ITEM_REQ_EX.increment();
            return Err(ItemError::NoMem);
        };

        let header = unsafe { chunk.as_ref() };
        debug_assert_eq!(header.class_id(), class_id);
        debug_assert!(!header.is_linked());
        debug_assert!(!header.in_freeq());
        debug_assert_eq!(header.refcount(), 0);

        self.acquire(header);
        header.reset(key.len() as u8, vlen as u32, exptime, self.use_cas);
        unsafe {
            let base = chunk.as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(key.as_ptr(), base.add(ITEM_HDR_SIZE), key.len());
            header.set_cas(0);
        }

        ITEM_REQ.increment();
        trace!(
            key = %String::from_utf8_lossy(key),
            class = class_id,
            offset = header.offset(),
            exptime,
            "alloc item"
        );

        Ok(ItemGuard {
            store: self,
            item: chunk,
        })
    }

    /// Look up `key`, expiring the stored item lazily.
    ///
    /// Returns a refcounted handle, or `None` on a miss. An item whose
    /// expiry has passed is unlinked as a side effect and reported as a
    /// miss.
    pub fn get(&self, key: &[u8]) -> Option<ItemGuard<'_>> {
        let found = { self.table.borrow().get(key) }?;
        let header = unsafe { found.as_ref() };

        if header.exptime() != 0 && header.exptime() <= time::now() {
            trace!(key = %String::from_utf8_lossy(key), "get expired item");
            self.unlink(found);
            return None;
        }

        self.acquire(header);
        trace!(
            key = %String::from_utf8_lossy(key),
            offset = header.offset(),
            refcount = header.refcount(),
            "get item"
        );

        Some(ItemGuard {
            store: self,
            item: found,
        })
    }

    /// Store `val` under `key`, replacing any prior item.
    pub fn set(&self, key: &[u8], val: &[u8], exptime: u32) -> ItemResult<()> {
        let new = self.alloc(key, exptime, val.len())?;
        unsafe { self.write_value(new.hdr(), val) };

        match self.get(key) {
            None => self.link(new.item),
            Some(old) => self.relink(old.item, new.item),
        }

        Ok(())
    }

    /// Store `val` under `key` only if the stored item's CAS value equals
    /// `expected`.
    ///
    /// Fails with [`ItemError::NotFound`] when the key is absent and
    /// [`ItemError::CasMismatch`] when the item changed since the caller
    /// read it; the stored item is untouched in both cases.
    pub fn cas(&self, key: &[u8], val: &[u8], exptime: u32, expected: u64) -> ItemResult<()> {
        let old = self.get(key).ok_or(ItemError::NotFound)?;

        if old.cas() != expected {
            debug!(
                key = %String::from_utf8_lossy(key),
                expected,
                current = old.cas(),
                "cas mismatch"
            );
            return Err(ItemError::CasMismatch);
        }

        let new = self.alloc(key, exptime, val.len())?;
        // Carries the caller's CAS until link stamps a fresh one.
        unsafe { new.hdr().set_cas(expected) };
        unsafe { self.write_value(new.hdr(), val) };

        self.relink(old.item, new.item);
        Ok(())
    }

    /// Append `val` to the stored value of `key`.
    pub fn append(&self, key: &[u8], val: &[u8]) -> ItemResult<()> {
        self.annex(key, val, true)
    }

    /// Prepend `val` to the stored value of `key`.
    pub fn prepend(&self, key: &[u8], val: &[u8]) -> ItemResult<()> {
        self.annex(key, val, false)
    }

    fn annex(&self, key: &[u8], val: &[u8], append: bool) -> ItemResult<()> {
        let old = self.get(key).ok_or(ItemError::NotFound)?;
        let oit = old.hdr();

        let total = oit.vlen() + val.len();
        let ntotal = item_ntotal(oit.klen(), total, self.use_cas);
        let class_id = self
            .pool
            .class_for_size(ntotal)
            .ok_or(ItemError::Oversized)?;

        if append {
            if class_id == oit.class_id() && !oit.is_raligned() {
                // Left-aligned with room in the chunk: grow to the right.
                let chunk_size = self.pool.chunk_size(oit.class_id());
                unsafe {
                    let dst = oit.value_ptr(chunk_size).add(oit.vlen());
                    std::ptr::copy_nonoverlapping(val.as_ptr(), dst, val.len());
                }
                self.grow_in_place(oit, total);
            } else {
                let new = self.alloc(key, oit.exptime(), total)?;
                let old_size = self.pool.chunk_size(oit.class_id());
                let new_size = self.pool.chunk_size(new.hdr().class_id());
                unsafe {
                    let dst = new.hdr().value_ptr(new_size);
                    std::ptr::copy_nonoverlapping(oit.value_ptr(old_size), dst, oit.vlen());
                    std::ptr::copy_nonoverlapping(val.as_ptr(), dst.add(oit.vlen()), val.len());
                    self.classify(new.hdr());
                }
                self.relink(old.item, new.item);
            }
        } else if class_id == oit.class_id() && oit.is_raligned() {
            // Right-aligned with room in the chunk: grow to the left.
            let chunk_size = self.pool.chunk_size(oit.class_id());
            unsafe {
                let dst = oit.value_ptr(chunk_size).sub(val.len());
                std::ptr::copy_nonoverlapping(val.as_ptr(), dst, val.len());
            }
            self.grow_in_place(oit, total);
        } else {
            // Store the new payload right-aligned on the assumption that
            // more prepends will follow.
            let new = self.alloc(key, oit.exptime(), total)?;
            new.hdr().set_raligned(true);
            let old_size = self.pool.chunk_size(oit.class_id());
            let new_size = self.pool.chunk_size(new.hdr().class_id());
            unsafe {
                let dst = new.hdr().value_ptr(new_size);
                std::ptr::copy_nonoverlapping(val.as_ptr(), dst, val.len());
                std::ptr::copy_nonoverlapping(
                    oit.value_ptr(old_size),
                    dst.add(val.len()),
                    oit.vlen(),
                );
                self.classify(new.hdr());
            }
            self.relink(old.item, new.item);
        }

        Ok(())
    }

    /// Finish an in-place annex: adjust byte accounting, bump the value
    /// length, re-issue the CAS value, and reclassify.
    fn grow_in_place(&self, header: &ItemHeader, total: usize) {
        let delta = (total - header.vlen()) as i64;
        ITEM_KEYVAL_BYTE.add(delta);
        ITEM_VAL_BYTE.add(delta);

        header.set_vlen(total as u32);
        unsafe {
            header.set_cas(self.next_cas());
            self.classify(header);
        }
    }

    /// Overwrite the value of an already-held item in place.
    ///
    /// Fails with [`ItemError::Oversized`] when the new value maps the item
    /// to a different slab class (in either direction). The CAS value and
    /// the hash index are untouched; the handle stays valid.
    pub fn update(&self, item: &ItemGuard<'_>, val: &[u8]) -> ItemResult<()> {
        let header = item.hdr();
        let ntotal = item_ntotal(header.klen(), val.len(), self.use_cas);
        if self.pool.class_for_size(ntotal) != Some(header.class_id()) {
            return Err(ItemError::Oversized);
        }

        if header.is_linked() {
            let delta = val.len() as i64 - header.vlen() as i64;
            ITEM_KEYVAL_BYTE.add(delta);
            ITEM_VAL_BYTE.add(delta);
        }

        header.set_vlen(val.len() as u32);
        let chunk_size = self.pool.chunk_size(header.class_id());
        unsafe {
            std::ptr::copy_nonoverlapping(val.as_ptr(), header.value_ptr(chunk_size), val.len());
            self.classify(header);
        }

        Ok(())
    }

    /// Remove `key` from the store.
    pub fn delete(&self, key: &[u8]) -> ItemResult<()> {
        match self.get(key) {
            Some(old) => {
                self.unlink(old.item);
                Ok(())
            }
            None => Err(ItemError::NotFound),
        }
    }

    /// Statistics for one slab class, or `None` for an out-of-range id.
    pub fn class_stats(&self, class_id: u8) -> Option<ClassStats> {
        self.pool.class_stats(class_id)
    }

    // Internal machinery below: CAS issuance, refcount and linkage
    // discipline, payload helpers.

    /// Next CAS value: positive and strictly increasing while CAS is
    /// enabled, always 0 otherwise.
    fn next_cas(&self) -> u64 {
        if self.use_cas {
            let cas = self.cas_counter.get() + 1;
            self.cas_counter.set(cas);
            cas
        } else {
            0
        }
    }

    fn acquire(&self, header: &ItemHeader) {
        header.check_magic();
        header.set_refcount(header.refcount() + 1);
        self.pool.acquire_slab(header);
    }

    /// Drop one refcount; the only path that frees a chunk.
    pub(crate) fn release(&self, item: NonNull<ItemHeader>) {
        let header = unsafe { item.as_ref() };
        header.check_magic();
        debug_assert!(!header.in_freeq());

        if header.refcount() > 0 {
            header.set_refcount(header.refcount() - 1);
            self.pool.release_slab(header);
        }

        if header.refcount() == 0 && !header.is_linked() {
            self.free(item);
        }
    }

    fn free(&self, item: NonNull<ItemHeader>) {
        ITEM_REMOVE.increment();
        self.pool.put_chunk(item);
    }

    /// Link an item into the hash index, stamping a fresh CAS value.
    fn link(&self, item: NonNull<ItemHeader>) {
        let header = unsafe { item.as_ref() };
        header.check_magic();
        debug_assert!(!header.is_linked());
        debug_assert!(!header.in_freeq());

        header.set_linked(true);
        unsafe { header.set_cas(self.next_cas()) };
        self.table.borrow_mut().put(unsafe { header.key() }, item);

        ITEM_LINK.increment();
        ITEM_CURR.increment();
        ITEM_KEYVAL_BYTE.add((header.klen() + header.vlen()) as i64);
        ITEM_VAL_BYTE.add(header.vlen() as i64);

        debug!(
            key = %String::from_utf8_lossy(unsafe { header.key() }),
            offset = header.offset(),
            class = header.class_id(),
            "link item"
        );
    }

    /// Sever hash reachability and update the linked-item accounting.
    fn sever(&self, header: &ItemHeader) {
        header.set_linked(false);
        let removed = self.table.borrow_mut().delete(unsafe { header.key() });
        debug_assert!(removed);

        ITEM_UNLINK.increment();
        ITEM_CURR.decrement();
        ITEM_KEYVAL_BYTE.sub((header.klen() + header.vlen()) as i64);
        ITEM_VAL_BYTE.sub(header.vlen() as i64);
    }

    /// Unlink an item from the hash index, freeing the chunk immediately
    /// when no handles remain.
    fn unlink(&self, item: NonNull<ItemHeader>) {
        let header = unsafe { item.as_ref() };
        header.check_magic();

        if header.is_linked() {
            debug!(
                key = %String::from_utf8_lossy(unsafe { header.key() }),
                offset = header.offset(),
                refcount = header.refcount(),
                "unlink item"
            );
            self.sever(header);
            if header.refcount() == 0 {
                self.free(item);
            }
        }
    }

    /// Sever a zero-refcount linked item without freeing its chunk, so the
    /// slab layer can hand the chunk out again.
    fn reuse(&self, item: NonNull<ItemHeader>) {
        let header = unsafe { item.as_ref() };
        header.check_magic();
        debug_assert!(header.is_linked());
        debug_assert!(!header.in_freeq());
        debug_assert_eq!(header.refcount(), 0);

        trace!(
            key = %String::from_utf8_lossy(unsafe { header.key() }),
            offset = header.offset(),
            "reuse item"
        );
        self.sever(header);
    }

    /// Replace `old` with `new` in the hash index. No interval exists in
    /// which both or neither are findable.
    fn relink(&self, old: NonNull<ItemHeader>, new: NonNull<ItemHeader>) {
        debug_assert!(!unsafe { old.as_ref() }.in_freeq());
        debug_assert!(!unsafe { new.as_ref() }.in_freeq());

        self.unlink(old);
        self.link(new);
    }

    /// Take a chunk for a class, evicting one slab if the pool is
    /// exhausted and policy allows.
    fn take_chunk(&self, class_id: u8) -> Option<NonNull<ItemHeader>> {
        if let Some(chunk) = self.pool.get_chunk(class_id) {
            return Some(chunk);
        }
        if self.pool.evict_class_slab(class_id, |victim| self.reuse(victim)) {
            self.pool.get_chunk(class_id)
        } else {
            None
        }
    }

    /// Copy `val` into the item's value area and reclassify.
    ///
    /// # Safety
    ///
    /// The item's `vlen` must equal `val.len()` and the chunk must be live.
    unsafe fn write_value(&self, header: &ItemHeader, val: &[u8]) {
        debug_assert_eq!(header.vlen(), val.len());
        let chunk_size = self.pool.chunk_size(header.class_id());
        std::ptr::copy_nonoverlapping(val.as_ptr(), header.value_ptr(chunk_size), val.len());
        self.classify(header);
    }

    /// Reclassify the value bytes as numeric or string.
    ///
    /// # Safety
    ///
    /// The chunk must be live with `vlen` describing the current value.
    unsafe fn classify(&self, header: &ItemHeader) {
        let chunk_size = self.pool.chunk_size(header.class_id());
        let vtype = if numeric::parse_decimal(header.value(chunk_size)).is_some() {
            ValueType::Int
        } else {
            ValueType::Str
        };
        header.set_vtype(vtype);
    }
}

impl Drop for ItemStore {
    fn drop(&mut self) {
        info!("item store torn down");
    }
}

/// Builder for [`ItemStore`].
#[derive(Debug, Clone, Default)]
pub struct ItemStoreBuilder {
    config: StoreConfig,
}

impl ItemStoreBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total heap size in bytes.
    pub fn heap_size(mut self, bytes: usize) -> Self {
        self.config.heap_size = bytes;
        self
    }

    /// Set the slab size in bytes. This bounds the largest storable item.
    pub fn slab_size(mut self, bytes: usize) -> Self {
        self.config.slab_size = bytes;
        self
    }

    /// Size the hash index to 2^power buckets.
    pub fn hash_power(mut self, power: u8) -> Self {
        self.config.hash_power = power;
        self
    }

    /// Enable or disable CAS values on items.
    pub fn use_cas(mut self, use_cas: bool) -> Self {
        self.config.use_cas = use_cas;
        self
    }

    /// Set the smallest chunk size.
    pub fn min_chunk_size(mut self, bytes: usize) -> Self {
        self.config.min_chunk_size = bytes;
        self
    }

    /// Set the growth factor between chunk classes.
    pub fn growth_factor(mut self, factor: f64) -> Self {
        self.config.growth_factor = factor;
        self
    }

    /// Set the slab eviction policy.
    pub fn eviction(mut self, policy: EvictionPolicy) -> Self {
        self.config.eviction = policy;
        self
    }

    /// Build the store.
    pub fn build(self) -> Result<ItemStore, ConfigError> {
        ItemStore::new(&self.config)
    }
}
