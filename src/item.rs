//! In-chunk item header, payload accessors, and the refcounted handle.
//!
//! An item occupies exactly one slab chunk. The chunk starts with a fixed
//! 24-byte header, followed by the key, an optional 8-byte CAS value, and
//! the value bytes:
//!
//! ```text
//! +--------+-----+-------+---------------------------+
//! | header | key | [cas] | value ...                 |  left-aligned
//! +--------+-----+-------+---------------------------+
//! | header | key | [cas] |          ... value        |  right-aligned
//! +--------+-----+-------+---------------------------+
//! ```
//!
//! A left-aligned value sits immediately after the key (and CAS); a
//! right-aligned value is flush with the end of the chunk, leaving the gap
//! in front of it so prepends can grow in place. Appends grow in place on
//! left-aligned items for the symmetric reason.

use std::cell::Cell;
use std::ptr::NonNull;

use crate::ItemStore;

/// Sentinel checked by debug assertions on every header access.
pub(crate) const ITEM_MAGIC: u32 = 0xBEAD_CAFE;

/// The size of the item header in bytes.
pub(crate) const ITEM_HDR_SIZE: usize = std::mem::size_of::<ItemHeader>();

/// Size of the embedded CAS value.
pub(crate) const CAS_SIZE: usize = std::mem::size_of::<u64>();

/// Maximum key length in bytes.
pub(crate) const KEY_MAX_LEN: usize = u8::MAX as usize;

/// Item is reachable through the hash index.
const FLAG_LINKED: u8 = 1 << 0;
/// Chunk is parked on its class free list.
const FLAG_IN_FREEQ: u8 = 1 << 1;
/// Value is flush with the chunk end.
const FLAG_RALIGNED: u8 = 1 << 2;
/// An 8-byte CAS value follows the key.
const FLAG_HAS_CAS: u8 = 1 << 3;

/// Classification of the value bytes, refreshed after every payload write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Not parseable as an unsigned 64-bit decimal.
    Str,
    /// Parses as an unsigned 64-bit decimal.
    Int,
}

/// Fixed header at the start of every chunk (24 bytes).
///
/// `magic`, `offset`, and `class_id` are written once when the enclosing
/// slab is carved and never change; everything else is rewritten each time
/// the chunk is handed out. Mutable fields are `Cell`s because headers are
/// only ever reached through shared references into slab memory.
#[repr(C)]
pub(crate) struct ItemHeader {
    magic: u32,
    offset: u32,
    refcount: Cell<u32>,
    vlen: Cell<u32>,
    exptime: Cell<u32>,
    class_id: u8,
    klen: Cell<u8>,
    vtype: Cell<u8>,
    flags: Cell<u8>,
}

const _: () = assert!(std::mem::size_of::<ItemHeader>() == 24);

/// Chunk bytes needed for a key/value pair.
#[inline]
pub(crate) fn item_ntotal(klen: usize, vlen: usize, use_cas: bool) -> usize {
    ITEM_HDR_SIZE + klen + if use_cas { CAS_SIZE } else { 0 } + vlen
}

impl ItemHeader {
    /// Write a pristine header into a freshly carved chunk.
    ///
    /// # Safety
    ///
    /// `ptr` must point to writable chunk memory of at least
    /// `ITEM_HDR_SIZE` bytes, aligned for `ItemHeader`, with no live
    /// references into it.
    pub(crate) unsafe fn init_chunk(ptr: *mut ItemHeader, offset: u32, class_id: u8) {
        ptr.write(ItemHeader {
            magic: ITEM_MAGIC,
            offset,
            refcount: Cell::new(0),
            vlen: Cell::new(0),
            exptime: Cell::new(0),
            class_id,
            klen: Cell::new(0),
            vtype: Cell::new(ValueType::Str as u8),
            flags: Cell::new(FLAG_IN_FREEQ),
        });
    }

    #[inline]
    pub(crate) fn check_magic(&self) {
        debug_assert_eq!(self.magic, ITEM_MAGIC);
    }

    #[inline]
    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub(crate) fn class_id(&self) -> u8 {
        self.class_id
    }

    #[inline]
    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.get()
    }

    #[inline]
    pub(crate) fn set_refcount(&self, refcount: u32) {
        self.refcount.set(refcount);
    }

    #[inline]
    pub(crate) fn klen(&self) -> usize {
        self.klen.get() as usize
    }

    #[inline]
    pub(crate) fn vlen(&self) -> usize {
        self.vlen.get() as usize
    }

    #[inline]
    pub(crate) fn set_vlen(&self, vlen: u32) {
        self.vlen.set(vlen);
    }

    #[inline]
    pub(crate) fn exptime(&self) -> u32 {
        self.exptime.get()
    }

    #[inline]
    pub(crate) fn vtype(&self) -> ValueType {
        if self.vtype.get() == ValueType::Int as u8 {
            ValueType::Int
        } else {
            ValueType::Str
        }
    }

    #[inline]
    pub(crate) fn set_vtype(&self, vtype: ValueType) {
        self.vtype.set(vtype as u8);
    }

    #[inline]
    fn flag(&self, mask: u8) -> bool {
        self.flags.get() & mask != 0
    }

    #[inline]
    fn set_flag(&self, mask: u8, on: bool) {
        if on {
            self.flags.set(self.flags.get() | mask);
        } else {
            self.flags.set(self.flags.get() & !mask);
        }
    }

    #[inline]
    pub(crate) fn is_linked(&self) -> bool {
        self.flag(FLAG_LINKED)
    }

    #[inline]
    pub(crate) fn set_linked(&self, linked: bool) {
        self.set_flag(FLAG_LINKED, linked);
    }

    #[inline]
    pub(crate) fn in_freeq(&self) -> bool {
        self.flag(FLAG_IN_FREEQ)
    }

    #[inline]
    pub(crate) fn set_in_freeq(&self, in_freeq: bool) {
        self.set_flag(FLAG_IN_FREEQ, in_freeq);
    }

    #[inline]
    pub(crate) fn is_raligned(&self) -> bool {
        self.flag(FLAG_RALIGNED)
    }

    #[inline]
    pub(crate) fn set_raligned(&self, raligned: bool) {
        self.set_flag(FLAG_RALIGNED, raligned);
    }

    #[inline]
    pub(crate) fn has_cas(&self) -> bool {
        self.flag(FLAG_HAS_CAS)
    }

    /// Rewrite the mutable header fields for a chunk leaving the free list.
    ///
    /// Clears linkage and alignment state; the caller copies the key and
    /// stamps the CAS field separately.
    pub(crate) fn reset(&self, klen: u8, vlen: u32, exptime: u32, has_cas: bool) {
        self.check_magic();
        self.klen.set(klen);
        self.vlen.set(vlen);
        self.exptime.set(exptime);
        self.vtype.set(ValueType::Str as u8);
        self.flags.set(if has_cas { FLAG_HAS_CAS } else { 0 });
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self as *const ItemHeader as *mut u8
    }

    /// Key bytes.
    ///
    /// # Safety
    ///
    /// The header must sit at the start of a live chunk whose key was
    /// written for the current occupant.
    #[inline]
    pub(crate) unsafe fn key(&self) -> &[u8] {
        self.check_magic();
        std::slice::from_raw_parts(self.base_ptr().add(ITEM_HDR_SIZE), self.klen())
    }

    /// Read the CAS value, or 0 when CAS is disabled.
    ///
    /// # Safety
    ///
    /// The header must sit at the start of a live chunk.
    #[inline]
    pub(crate) unsafe fn cas(&self) -> u64 {
        if self.has_cas() {
            let ptr = self.base_ptr().add(ITEM_HDR_SIZE + self.klen());
            std::ptr::read_unaligned(ptr as *const u64)
        } else {
            0
        }
    }

    /// Stamp the CAS value. A no-op when CAS is disabled.
    ///
    /// # Safety
    ///
    /// The header must sit at the start of a live chunk.
    #[inline]
    pub(crate) unsafe fn set_cas(&self, cas: u64) {
        if self.has_cas() {
            let ptr = self.base_ptr().add(ITEM_HDR_SIZE + self.klen());
            std::ptr::write_unaligned(ptr as *mut u64, cas);
        }
    }

    /// Pointer to the first value byte, honoring alignment.
    ///
    /// # Safety
    ///
    /// The header must sit at the start of a live chunk of exactly
    /// `chunk_size` bytes, and `vlen` must describe the current value.
    #[inline]
    pub(crate) unsafe fn value_ptr(&self, chunk_size: usize) -> *mut u8 {
        if self.is_raligned() {
            self.base_ptr().add(chunk_size - self.vlen())
        } else {
            let cas = if self.has_cas() { CAS_SIZE } else { 0 };
            self.base_ptr().add(ITEM_HDR_SIZE + self.klen() + cas)
        }
    }

    /// Value bytes.
    ///
    /// # Safety
    ///
    /// Same contract as [`ItemHeader::value_ptr`].
    #[inline]
    pub(crate) unsafe fn value(&self, chunk_size: usize) -> &[u8] {
        std::slice::from_raw_parts(self.value_ptr(chunk_size), self.vlen())
    }
}

/// A refcounted handle to a stored item.
///
/// Holding a guard pins the item's chunk: the chunk is not freed or evicted
/// while any guard exists, even if the item is replaced or deleted from the
/// index in the meantime. The refcount is released when the guard drops.
pub struct ItemGuard<'a> {
    pub(crate) store: &'a ItemStore,
    pub(crate) item: NonNull<ItemHeader>,
}

impl ItemGuard<'_> {
    #[inline]
    pub(crate) fn hdr(&self) -> &ItemHeader {
        // Pinned by this guard's refcount for as long as the guard lives.
        unsafe { self.item.as_ref() }
    }

    /// The item key.
    #[inline]
    pub fn key(&self) -> &[u8] {
        unsafe { self.hdr().key() }
    }

    /// The item value.
    ///
    /// The slice reads the chunk directly; a write operation on the same key
    /// while this guard is held may rewrite it in place.
    #[inline]
    pub fn value(&self) -> &[u8] {
        let chunk_size = self.store.pool.chunk_size(self.hdr().class_id());
        unsafe { self.hdr().value(chunk_size) }
    }

    /// The CAS value stamped when the item was linked, or 0 when CAS is
    /// disabled.
    #[inline]
    pub fn cas(&self) -> u64 {
        unsafe { self.hdr().cas() }
    }

    /// Absolute expiry in relative seconds; 0 means the item never expires.
    #[inline]
    pub fn exptime(&self) -> u32 {
        self.hdr().exptime()
    }

    /// Classification of the current value bytes.
    #[inline]
    pub fn value_type(&self) -> ValueType {
        self.hdr().vtype()
    }
}

impl Drop for ItemGuard<'_> {
    fn drop(&mut self) {
        self.store.release(self.item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Chunk([u8; 128]);

    fn init(chunk: &mut Chunk) -> &ItemHeader {
        let ptr = chunk.0.as_mut_ptr() as *mut ItemHeader;
        unsafe {
            ItemHeader::init_chunk(ptr, 0, 3);
            &*ptr
        }
    }

    #[test]
    fn test_header_size() {
        assert_eq!(ITEM_HDR_SIZE, 24);
    }

    #[test]
    fn test_init_chunk_state() {
        let mut chunk = Chunk([0; 128]);
        let hdr = init(&mut chunk);

        hdr.check_magic();
        assert_eq!(hdr.class_id(), 3);
        assert_eq!(hdr.offset(), 0);
        assert_eq!(hdr.refcount(), 0);
        assert!(hdr.in_freeq());
        assert!(!hdr.is_linked());
        assert!(!hdr.is_raligned());
    }

    #[test]
    fn test_reset_clears_flags() {
        let mut chunk = Chunk([0; 128]);
        let hdr = init(&mut chunk);

        hdr.set_in_freeq(false);
        hdr.set_raligned(true);
        hdr.reset(4, 10, 99, true);

        assert_eq!(hdr.klen(), 4);
        assert_eq!(hdr.vlen(), 10);
        assert_eq!(hdr.exptime(), 99);
        assert!(hdr.has_cas());
        assert!(!hdr.is_raligned());
        assert!(!hdr.is_linked());
        assert!(!hdr.in_freeq());
        assert_eq!(hdr.vtype(), ValueType::Str);
    }

    #[test]
    fn test_payload_layout_left_aligned() {
        let mut chunk = Chunk([0; 128]);
        let hdr = init(&mut chunk);
        hdr.reset(3, 5, 0, true);

        unsafe {
            std::ptr::copy_nonoverlapping(b"foo".as_ptr(), hdr.base_ptr().add(ITEM_HDR_SIZE), 3);
            hdr.set_cas(42);
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), hdr.value_ptr(128), 5);

            assert_eq!(hdr.key(), b"foo");
            assert_eq!(hdr.cas(), 42);
            assert_eq!(hdr.value(128), b"hello");
            // Value sits right after header, key, and CAS.
            assert_eq!(
                hdr.value_ptr(128) as usize - hdr.base_ptr() as usize,
                ITEM_HDR_SIZE + 3 + CAS_SIZE
            );
        }
    }

    #[test]
    fn test_payload_layout_right_aligned() {
        let mut chunk = Chunk([0; 128]);
        let hdr = init(&mut chunk);
        hdr.reset(3, 5, 0, true);
        hdr.set_raligned(true);

        unsafe {
            std::ptr::copy_nonoverlapping(b"world".as_ptr(), hdr.value_ptr(128), 5);
            assert_eq!(hdr.value(128), b"world");
            // Value is flush with the chunk end.
            assert_eq!(
                hdr.value_ptr(128) as usize - hdr.base_ptr() as usize,
                128 - 5
            );
        }
    }

    #[test]
    fn test_cas_disabled_reads_zero() {
        let mut chunk = Chunk([0; 128]);
        let hdr = init(&mut chunk);
        hdr.reset(3, 5, 0, false);

        unsafe {
            hdr.set_cas(42);
            assert_eq!(hdr.cas(), 0);
        }
    }

    #[test]
    fn test_ntotal() {
        assert_eq!(item_ntotal(3, 5, true), ITEM_HDR_SIZE + 3 + 8 + 5);
        assert_eq!(item_ntotal(3, 5, false), ITEM_HDR_SIZE + 3 + 5);
    }
}
