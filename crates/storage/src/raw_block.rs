//! Provides [`RawBlock`], a page-sized, page-aligned byte buffer,
//! and [`initialize_raw_block`], which stamps it for use under a [`BlockLayout`].
//!
//! A `RawBlock` has no structure by itself.
//! The structure, i.e., where the header, the allocation bitmap,
//! and each column's null bitmap and value array live,
//! is imposed by a `BlockLayout` through a
//! [`TupleAccessStrategy`](crate::tuple_access::TupleAccessStrategy).
//!
//! Many threads share one `&RawBlock`.
//! The bitmaps and header counters are only ever accessed atomically,
//! while value bytes are accessed through `unsafe` accessors
//! whose callers promise to serialize access per slot.

use crate::indexes::{
    BlockId, BLOCK_HEADER_SIZE, BLOCK_SIZE, HEADER_BLOCK_ID, HEADER_LAYOUT_FINGERPRINT, HEADER_NUM_COLS,
    HEADER_NUM_RECORDS, HEADER_NUM_SLOTS,
};
use crate::layout::BlockLayout;
use crate::util::range_move;
use crate::{static_assert_align, static_assert_size};
use core::cell::UnsafeCell;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use core::{mem, ptr, slice};

/// A single fixed-size block of tuple storage.
///
/// The block is exactly one hardware page large and aligned to that size.
/// Blocks are handed out by a [`BlockStore`](crate::block_store::BlockStore)
/// and must be initialized by [`initialize_raw_block`] before use.
#[repr(C, align(4096))]
pub struct RawBlock {
    /// The bytes of the block.
    ///
    /// Wrapped in an `UnsafeCell` as threads holding `&RawBlock`
    /// write to disjoint parts of it concurrently.
    data: UnsafeCell<[u8; BLOCK_SIZE]>,
}

static_assert_size!(RawBlock, BLOCK_SIZE);
static_assert_align!(RawBlock, BLOCK_SIZE);

// SAFETY: Shared mutation of a `RawBlock` either happens through atomics,
// for the header counters and all bitmaps,
// or through `unsafe` accessors whose callers guarantee
// that no two threads access the same value bytes while one of them writes.
unsafe impl Sync for RawBlock {}

impl RawBlock {
    /// Returns a new, zero-filled block allocated on the heap.
    pub fn new_zeroed() -> Box<Self> {
        use std::alloc::{alloc_zeroed, handle_alloc_error, Layout};

        let layout = Layout::new::<RawBlock>();
        // SAFETY: The layout's size is non-zero.
        let raw: *mut RawBlock = unsafe { alloc_zeroed(layout) }.cast();

        if raw.is_null() {
            handle_alloc_error(layout);
        }

        // SAFETY: We used the global allocator with a layout for `RawBlock`.
        // All-zero bytes are a valid `[u8; BLOCK_SIZE]`, and thus a valid `RawBlock`.
        unsafe { Box::from_raw(raw) }
    }

    /// Zeroes every byte of the block, including its header.
    pub fn zero(&mut self) {
        self.data.get_mut().fill(0);
    }

    /// Returns the identifier the block was stamped with by [`initialize_raw_block`].
    pub fn block_id(&self) -> BlockId {
        BlockId(u64::from_le_bytes(self.read_header(HEADER_BLOCK_ID)))
    }

    /// Returns the number of slots allocated in this block so far.
    pub fn num_records(&self) -> u32 {
        self.atomic_u32(HEADER_NUM_RECORDS).load(Ordering::Relaxed)
    }

    /// Returns the number of slots the block was initialized for.
    pub(crate) fn header_num_slots(&self) -> u32 {
        u32::from_le_bytes(self.read_header(HEADER_NUM_SLOTS))
    }

    /// Returns the number of columns the block was initialized for.
    pub(crate) fn header_num_cols(&self) -> u16 {
        u16::from_le_bytes(self.read_header(HEADER_NUM_COLS))
    }

    /// Returns the fingerprint of the layout the block was initialized for.
    pub(crate) fn header_fingerprint(&self) -> u64 {
        u64::from_le_bytes(self.read_header(HEADER_LAYOUT_FINGERPRINT))
    }

    /// Asserts that the block was initialized for `layout`.
    ///
    /// A mismatched layout would put bitmap offsets on top of value bytes,
    /// so this also holds in release mode.
    #[inline]
    pub(crate) fn check_layout(&self, layout: &BlockLayout) {
        assert!(
            self.header_num_slots() == layout.num_slots()
                && self.header_num_cols() == layout.num_cols()
                && self.header_fingerprint() == layout.fingerprint(),
            "block {} was initialized for a different layout",
            self.block_id(),
        );
    }

    /// Like [`RawBlock::check_layout`], but a no-op in release mode.
    #[inline]
    pub(crate) fn debug_check_layout(&self, layout: &BlockLayout) {
        if cfg!(debug_assertions) {
            self.check_layout(layout);
        }
    }

    /// Reads `N` bytes of the header starting at `offset`.
    ///
    /// Only used for fields that are written exclusively through `&mut self`.
    fn read_header<const N: usize>(&self, offset: usize) -> [u8; N] {
        assert!(offset + N <= BLOCK_HEADER_SIZE);
        let mut buf = [0; N];
        // SAFETY: The range is in bounds of the header per the assertion above.
        // The header fields read here are only written through `&mut self`,
        // so no other thread can be writing to them.
        unsafe { ptr::copy_nonoverlapping(self.base_ptr().add(offset), buf.as_mut_ptr(), N) };
        buf
    }

    /// Returns a raw pointer to the first byte of the block.
    #[inline(always)]
    fn base_ptr(&self) -> *mut u8 {
        self.data.get().cast()
    }

    /// Returns a pointer into the block at `offset`, for an object of type `T`.
    ///
    /// Panics if the object would not be in bounds of the block
    /// and, in debug mode, if the pointer would not be aligned for `T`.
    #[inline(always)]
    fn checked_ptr<T>(&self, offset: usize) -> *mut T {
        assert!(offset + mem::size_of::<T>() <= BLOCK_SIZE);
        debug_assert_eq!(offset % mem::align_of::<T>(), 0);
        // SAFETY: `offset` is in bounds per the assertion above.
        unsafe { self.base_ptr().add(offset) }.cast()
    }

    /// Returns the byte at `offset` viewed as an atomic.
    #[inline]
    pub(crate) fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        let ptr = self.checked_ptr::<AtomicU8>(offset);
        // SAFETY: `ptr` is in bounds and, as `AtomicU8` has alignment 1, aligned.
        // It is valid for the lifetime of `&self`.
        // All bitmap bytes are only accessed atomically while shared.
        unsafe { AtomicU8::from_ptr(ptr.cast()) }
    }

    /// Returns the four bytes at `offset` viewed as an atomic.
    #[inline]
    pub(crate) fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        let ptr = self.checked_ptr::<AtomicU32>(offset);
        // SAFETY: `ptr` is in bounds, and the header offsets passed here are 4-aligned
        // within a block aligned to `BLOCK_SIZE`.
        // The header counters are only accessed atomically while shared.
        unsafe { AtomicU32::from_ptr(ptr.cast()) }
    }

    /// Returns `len` consecutive 64-bit words starting at `offset` viewed as atomics.
    #[inline]
    pub(crate) fn atomic_words(&self, offset: usize, len: usize) -> &[AtomicU64] {
        assert!(offset + len * mem::size_of::<AtomicU64>() <= BLOCK_SIZE);
        assert_eq!(offset % mem::align_of::<AtomicU64>(), 0);
        // SAFETY: The range is in bounds and aligned per the assertions above,
        // and `AtomicU64` has the same in-memory representation as `u64`.
        // The allocation bitmap is only accessed atomically while shared.
        unsafe { slice::from_raw_parts(self.base_ptr().add(offset).cast::<AtomicU64>(), len) }
    }

    /// Returns a shared view of `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// - `offset + len` must be in bounds of the block.
    /// - No other thread may write to the bytes for the lifetime of the returned slice.
    #[inline]
    pub(crate) unsafe fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= BLOCK_SIZE);
        // SAFETY: Per caller contract, the range is in bounds and not concurrently written.
        unsafe { slice::from_raw_parts(self.base_ptr().add(offset), len) }
    }

    /// Returns a mutable view of `len` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// - `offset + len` must be in bounds of the block.
    /// - No other thread or reference may access the bytes
    ///   for the lifetime of the returned slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= BLOCK_SIZE);
        // SAFETY: Per caller contract, the range is in bounds and exclusively ours.
        // Writing through a shared reference is permitted as the bytes live in an `UnsafeCell`.
        unsafe { slice::from_raw_parts_mut(self.base_ptr().add(offset), len) }
    }
}

/// Stamps `block` with `block_id` and prepares it for use under `layout`.
///
/// Resets the header, i.e., the insert head and the record count,
/// clears the allocation bitmap, and marks every slot of every column as null.
/// Value bytes are left as they are.
///
/// Must be called before any [`TupleAccessStrategy`](crate::tuple_access::TupleAccessStrategy)
/// operation touches the block.
/// As this takes `&mut RawBlock`, it can never race with such operations.
pub fn initialize_raw_block(block: &mut RawBlock, layout: &BlockLayout, block_id: BlockId) {
    let data = block.data.get_mut();

    // The fixed header; also zeroes the insert head and the record count.
    data[..BLOCK_HEADER_SIZE].fill(0);
    let mut write = |range: Range<usize>, bytes: &[u8]| data[range].copy_from_slice(bytes);
    write(range_move(0..8, HEADER_BLOCK_ID), &block_id.0.to_le_bytes());
    write(range_move(0..4, HEADER_NUM_SLOTS), &layout.num_slots().to_le_bytes());
    write(range_move(0..2, HEADER_NUM_COLS), &layout.num_cols().to_le_bytes());
    write(range_move(0..8, HEADER_LAYOUT_FINGERPRINT), &layout.fingerprint().to_le_bytes());

    // The allocation bitmap: all slots free.
    let alloc_bitmap_len = layout.alloc_bitmap_words() * mem::size_of::<u64>();
    data[range_move(0..alloc_bitmap_len, BLOCK_HEADER_SIZE)].fill(0);

    // The null bitmaps: all values null.
    let bitmap_size = layout.null_bitmap_size();
    for col in 0..layout.num_cols() {
        let start = layout.null_bitmap_offset(col.into());
        data[range_move(0..bitmap_size, start)].fill(0);
    }

    log::trace!(
        "initialized block {block_id} for {} slots of {} columns",
        layout.num_slots(),
        layout.num_cols()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexes::{ColId, HEADER_INSERT_HEAD};

    #[test]
    fn new_block_is_zeroed_and_aligned() {
        let block = RawBlock::new_zeroed();
        assert_eq!((&*block as *const RawBlock as usize) % BLOCK_SIZE, 0);
        // SAFETY: Nobody else has access to `block`.
        let bytes = unsafe { block.bytes(0, BLOCK_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn initialize_stamps_header_and_clears_bitmaps() {
        let layout = BlockLayout::new(&[4, 1, 8]).unwrap();
        let mut block = RawBlock::new_zeroed();
        // SAFETY: Nobody else has access to `block`.
        unsafe { block.bytes_mut(0, BLOCK_SIZE) }.fill(0xFF);

        initialize_raw_block(&mut block, &layout, BlockId(42));

        assert_eq!(block.block_id(), BlockId(42));
        assert_eq!(block.header_num_slots(), layout.num_slots());
        assert_eq!(block.header_num_cols(), 3);
        assert_eq!(block.header_fingerprint(), layout.fingerprint());
        block.check_layout(&layout);
        assert_eq!(block.num_records(), 0);
        assert_eq!(block.atomic_u32(HEADER_INSERT_HEAD).load(Ordering::Relaxed), 0);

        let words = block.atomic_words(BLOCK_HEADER_SIZE, layout.alloc_bitmap_words());
        assert!(words.iter().all(|w| w.load(Ordering::Relaxed) == 0));

        for col in 0..layout.num_cols() {
            let col = ColId(col);
            let start = layout.null_bitmap_offset(col);
            // SAFETY: Nobody else has access to `block`.
            let bitmap = unsafe { block.bytes(start, layout.null_bitmap_size()) };
            assert!(bitmap.iter().all(|&b| b == 0));
            // Value bytes are untouched.
            // SAFETY: Nobody else has access to `block`.
            let values = unsafe { block.bytes(layout.values_offset(col), layout.attr_size(col)) };
            assert!(values.iter().all(|&b| b == 0xFF));
        }
    }

    #[test]
    fn zero_wipes_everything() {
        let layout = BlockLayout::new(&[8]).unwrap();
        let mut block = RawBlock::new_zeroed();
        initialize_raw_block(&mut block, &layout, BlockId(7));
        block.zero();
        assert_eq!(block.block_id(), BlockId(0));
        assert_eq!(block.header_num_slots(), 0);
    }

    #[test]
    #[should_panic(expected = "initialized for a different layout")]
    fn check_layout_rejects_same_shape_layout() {
        let mut block = RawBlock::new_zeroed();
        initialize_raw_block(&mut block, &BlockLayout::new(&[4, 1, 8]).unwrap(), BlockId(1));
        block.check_layout(&BlockLayout::new(&[1, 4, 8]).unwrap());
    }
}
