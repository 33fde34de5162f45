//! Slab pool: heap memory, slab classes, free lists, and slab eviction.
//!
//! The heap is one contiguous allocation carved into fixed-size slabs on
//! demand. Each slab belongs to exactly one class and is divided into that
//! class's chunks; chunk headers are initialized when the slab is carved
//! and chunks then cycle between the class free list and live items.
//!
//! Every slab mirrors the refcounts of the items inside it, so a slab
//! holding any pinned item is never selected as an eviction victim.

use std::alloc::{self, Layout};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ptr::NonNull;

use tracing::debug;

use crate::config::{EvictionPolicy, StoreConfig, CHUNK_ALIGN};
use crate::error::ConfigError;
use crate::item::ItemHeader;
use crate::time;

/// Owned heap allocation backing all slabs.
struct Heap {
    base: NonNull<u8>,
    layout: Layout,
}

impl Heap {
    fn new(size: usize) -> Result<Self, ConfigError> {
        let layout =
            Layout::from_size_align(size, CHUNK_ALIGN).map_err(|_| ConfigError::AllocationFailed)?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(ConfigError::AllocationFailed)?;
        Ok(Self { base, layout })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Per-slab bookkeeping, indexed by slab id in carve order.
struct SlabInfo {
    class_id: u8,
    /// Sum of the refcounts of items inside this slab.
    refcount: Cell<u32>,
    /// Carve time, refreshed when the slab is emptied by eviction.
    created_at: Cell<u32>,
}

/// One chunk size class.
struct SlabClass {
    chunk_size: usize,
    free: RefCell<VecDeque<NonNull<ItemHeader>>>,
    slab_ids: RefCell<Vec<u32>>,
}

impl SlabClass {
    fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size,
            free: RefCell::new(VecDeque::new()),
            slab_ids: RefCell::new(Vec::new()),
        }
    }
}

/// Statistics for one slab class.
#[derive(Debug, Clone)]
pub struct ClassStats {
    /// Class id.
    pub class_id: u8,
    /// Chunk size in bytes.
    pub chunk_size: usize,
    /// Slabs carved for this class.
    pub slab_count: usize,
    /// Chunks currently on the free list.
    pub free_chunks: usize,
}

pub(crate) struct SlabPool {
    heap: Heap,
    slab_size: usize,
    nslabs: usize,
    classes: Box<[SlabClass]>,
    slabs: RefCell<Vec<SlabInfo>>,
    eviction: EvictionPolicy,
}

impl SlabPool {
    pub(crate) fn new(config: &StoreConfig) -> Result<Self, ConfigError> {
        let chunk_sizes = config.chunk_sizes()?;
        let nslabs = config.slab_count();
        let heap = Heap::new(nslabs * config.slab_size)?;

        let classes: Box<[SlabClass]> = chunk_sizes
            .into_iter()
            .map(SlabClass::new)
            .collect();

        Ok(Self {
            heap,
            slab_size: config.slab_size,
            nslabs,
            classes,
            slabs: RefCell::new(Vec::new()),
            eviction: config.eviction,
        })
    }

    pub(crate) fn nclasses(&self) -> usize {
        self.classes.len()
    }

    /// Smallest class whose chunk size is at least `size`.
    pub(crate) fn class_for_size(&self, size: usize) -> Option<u8> {
        let index = self.classes.partition_point(|class| class.chunk_size < size);
        if index < self.classes.len() {
            Some(index as u8)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn chunk_size(&self, class_id: u8) -> usize {
        self.classes[class_id as usize].chunk_size
    }

    /// Take a chunk from the class free list, carving a new slab when the
    /// list is empty. Returns `None` once the heap is fully carved; the
    /// caller decides whether to evict and retry.
    pub(crate) fn get_chunk(&self, class_id: u8) -> Option<NonNull<ItemHeader>> {
        let class = &self.classes[class_id as usize];

        let mut chunk = class.free.borrow_mut().pop_front();
        if chunk.is_none() {
            self.carve_slab(class_id)?;
            chunk = class.free.borrow_mut().pop_front();
        }

        let chunk = chunk?;
        let header = unsafe { chunk.as_ref() };
        header.check_magic();
        debug_assert!(header.in_freeq());
        debug_assert!(!header.is_linked());
        debug_assert_eq!(header.refcount(), 0);
        header.set_in_freeq(false);
        Some(chunk)
    }

    /// Return a chunk to its class free list.
    pub(crate) fn put_chunk(&self, chunk: NonNull<ItemHeader>) {
        let header = unsafe { chunk.as_ref() };
        header.check_magic();
        debug_assert!(!header.is_linked());
        debug_assert!(!header.in_freeq());
        debug_assert_eq!(header.refcount(), 0);

        header.set_in_freeq(true);
        self.classes[header.class_id() as usize]
            .free
            .borrow_mut()
            .push_back(chunk);
    }

    /// Carve the next unassigned slab for `class_id` and fill the class
    /// free list with its chunks.
    fn carve_slab(&self, class_id: u8) -> Option<()> {
        let slab_id = {
            let mut slabs = self.slabs.borrow_mut();
            if slabs.len() == self.nslabs {
                return None;
            }
            let slab_id = slabs.len() as u32;
            slabs.push(SlabInfo {
                class_id,
                refcount: Cell::new(0),
                created_at: Cell::new(time::now()),
            });
            slab_id
        };

        let class = &self.classes[class_id as usize];
        class.slab_ids.borrow_mut().push(slab_id);

        let base = unsafe { self.heap.base().add(slab_id as usize * self.slab_size) };
        let nchunks = self.slab_size / class.chunk_size;
        let mut free = class.free.borrow_mut();
        for index in 0..nchunks {
            let offset = index * class.chunk_size;
            let ptr = unsafe { base.add(offset) } as *mut ItemHeader;
            unsafe { ItemHeader::init_chunk(ptr, offset as u32, class_id) };
            free.push_back(unsafe { NonNull::new_unchecked(ptr) });
        }

        debug!(slab = slab_id, class = class_id, chunks = nchunks, "carved slab");
        Some(())
    }

    /// Slab id of the item's enclosing slab.
    fn slab_index(&self, header: &ItemHeader) -> usize {
        debug_assert!((header.offset() as usize) < self.slab_size);
        let addr = header as *const ItemHeader as usize;
        (addr - self.heap.base() as usize) / self.slab_size
    }

    /// Mirror an item refcount acquisition into its slab.
    pub(crate) fn acquire_slab(&self, header: &ItemHeader) {
        let index = self.slab_index(header);
        let slabs = self.slabs.borrow();
        let refcount = &slabs[index].refcount;
        refcount.set(refcount.get() + 1);
    }

    /// Mirror an item refcount release into its slab.
    pub(crate) fn release_slab(&self, header: &ItemHeader) {
        let index = self.slab_index(header);
        let slabs = self.slabs.borrow();
        let refcount = &slabs[index].refcount;
        debug_assert!(refcount.get() > 0);
        refcount.set(refcount.get() - 1);
    }

    /// Evict one slab of `class_id` per the configured policy, invoking
    /// `on_reuse` for every linked item so the caller can sever its hash
    /// reachability, then recycle all of the slab's chunks.
    ///
    /// Returns false when eviction is disabled or every slab of the class
    /// has a pinned item.
    pub(crate) fn evict_class_slab(
        &self,
        class_id: u8,
        mut on_reuse: impl FnMut(NonNull<ItemHeader>),
    ) -> bool {
        if self.eviction == EvictionPolicy::None {
            return false;
        }

        let class = &self.classes[class_id as usize];
        let victim = {
            let slabs = self.slabs.borrow();
            let slab_ids = class.slab_ids.borrow();
            slab_ids
                .iter()
                .copied()
                .filter(|&id| slabs[id as usize].refcount.get() == 0)
                .min_by_key(|&id| slabs[id as usize].created_at.get())
        };
        let Some(victim) = victim else {
            return false;
        };
        debug_assert_eq!(self.slabs.borrow()[victim as usize].class_id, class_id);

        let base = unsafe { self.heap.base().add(victim as usize * self.slab_size) };
        let nchunks = self.slab_size / class.chunk_size;
        for index in 0..nchunks {
            let ptr = unsafe { base.add(index * class.chunk_size) } as *mut ItemHeader;
            let chunk = unsafe { NonNull::new_unchecked(ptr) };
            let header = unsafe { chunk.as_ref() };
            header.check_magic();

            // Chunks already on the free list stay where they are.
            if header.in_freeq() {
                continue;
            }
            debug_assert_eq!(header.refcount(), 0);

            if header.is_linked() {
                on_reuse(chunk);
            }
            debug_assert!(!header.is_linked());

            header.set_in_freeq(true);
            class.free.borrow_mut().push_back(chunk);
        }

        self.slabs.borrow()[victim as usize]
            .created_at
            .set(time::now());

        debug!(slab = victim, class = class_id, "evicted slab");
        true
    }

    pub(crate) fn class_stats(&self, class_id: u8) -> Option<ClassStats> {
        let class = self.classes.get(class_id as usize)?;
        Some(ClassStats {
            class_id,
            chunk_size: class.chunk_size,
            slab_count: class.slab_ids.borrow().len(),
            free_chunks: class.free.borrow().len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(heap_size: usize, slab_size: usize, eviction: EvictionPolicy) -> SlabPool {
        let config = StoreConfig {
            heap_size,
            slab_size,
            min_chunk_size: 64,
            eviction,
            ..Default::default()
        };
        SlabPool::new(&config).unwrap()
    }

    #[test]
    fn test_class_for_size() {
        let pool = test_pool(64 * 1024, 4096, EvictionPolicy::None);

        assert_eq!(pool.class_for_size(1), Some(0));
        assert_eq!(pool.class_for_size(64), Some(0));
        assert_eq!(pool.class_for_size(65), Some(1));
        assert_eq!(pool.chunk_size(0), 64);

        // The final class spans the whole slab.
        let last = (pool.nclasses() - 1) as u8;
        assert_eq!(pool.chunk_size(last), 4096);
        assert_eq!(pool.class_for_size(4096), Some(last));
        assert_eq!(pool.class_for_size(4097), None);
    }

    #[test]
    fn test_get_chunk_carves_on_demand() {
        let pool = test_pool(8192, 4096, EvictionPolicy::None);

        let stats = pool.class_stats(0).unwrap();
        assert_eq!(stats.slab_count, 0);
        assert_eq!(stats.free_chunks, 0);

        let chunk = pool.get_chunk(0).unwrap();
        let header = unsafe { chunk.as_ref() };
        assert_eq!(header.class_id(), 0);
        assert!(!header.in_freeq());

        let stats = pool.class_stats(0).unwrap();
        assert_eq!(stats.slab_count, 1);
        assert_eq!(stats.free_chunks, 4096 / 64 - 1);
    }

    #[test]
    fn test_put_chunk_round_trip() {
        let pool = test_pool(8192, 4096, EvictionPolicy::None);

        let chunk = pool.get_chunk(0).unwrap();
        let free_before = pool.class_stats(0).unwrap().free_chunks;
        pool.put_chunk(chunk);

        let stats = pool.class_stats(0).unwrap();
        assert_eq!(stats.free_chunks, free_before + 1);
        assert!(unsafe { chunk.as_ref() }.in_freeq());
    }

    #[test]
    fn test_heap_exhaustion() {
        // One slab, largest class only: a single chunk.
        let pool = test_pool(4096, 4096, EvictionPolicy::None);
        let last = (pool.nclasses() - 1) as u8;

        let chunk = pool.get_chunk(last).unwrap();
        assert!(pool.get_chunk(last).is_none());
        assert!(pool.get_chunk(0).is_none());

        pool.put_chunk(chunk);
        assert!(pool.get_chunk(last).is_some());
    }

    #[test]
    fn test_evict_disabled() {
        let pool = test_pool(4096, 4096, EvictionPolicy::None);
        assert!(!pool.evict_class_slab(0, |_| panic!("no linked items")));
    }

    #[test]
    fn test_evict_recycles_unpinned_slab() {
        let pool = test_pool(4096, 4096, EvictionPolicy::Lrc);
        let last = (pool.nclasses() - 1) as u8;

        let chunk = pool.get_chunk(last).unwrap();
        assert!(pool.get_chunk(last).is_none());

        // The chunk is allocated but unlinked and unpinned, so the slab can
        // be reclaimed; no reuse callback fires.
        assert!(pool.evict_class_slab(last, |_| panic!("nothing linked")));
        assert!(pool.get_chunk(last).is_some());
        let _ = chunk;
    }

    #[test]
    fn test_evict_skips_pinned_slab() {
        let pool = test_pool(4096, 4096, EvictionPolicy::Lrc);
        let last = (pool.nclasses() - 1) as u8;

        let chunk = pool.get_chunk(last).unwrap();
        let header = unsafe { chunk.as_ref() };
        header.set_refcount(1);
        pool.acquire_slab(header);

        assert!(!pool.evict_class_slab(last, |_| ()));

        header.set_refcount(0);
        pool.release_slab(header);
        assert!(pool.evict_class_slab(last, |_| ()));
    }

    #[test]
    fn test_slab_refcount_mirroring() {
        let pool = test_pool(8192, 4096, EvictionPolicy::Lrc);
        let a = pool.get_chunk(0).unwrap();
        let b = pool.get_chunk(0).unwrap();

        // Two items in the same slab each contribute to the slab refcount.
        unsafe {
            a.as_ref().set_refcount(1);
            b.as_ref().set_refcount(1);
        }
        pool.acquire_slab(unsafe { a.as_ref() });
        pool.acquire_slab(unsafe { b.as_ref() });

        assert!(!pool.evict_class_slab(0, |_| ()));

        unsafe { a.as_ref() }.set_refcount(0);
        pool.release_slab(unsafe { a.as_ref() });
        assert!(!pool.evict_class_slab(0, |_| ()));

        unsafe { b.as_ref() }.set_refcount(0);
        pool.release_slab(unsafe { b.as_ref() });
        assert!(pool.evict_class_slab(0, |_| ()));
    }
}
