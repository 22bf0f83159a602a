//! Provides [`TupleAccessStrategy`], which interprets a [`RawBlock`]
//! according to a [`BlockLayout`].
//!
//! The strategy is where tuples get their slots and where attribute bytes are found.
//! It is stateless beyond a reference to its layout,
//! so it is `Copy` and may be shared freely between threads.
//!
//! Concurrency is split in two:
//! - Slot allocation, null bits, and the header counters are lock-free and may race freely.
//!   Two calls to [`TupleAccessStrategy::allocate`] never return the same slot.
//! - Attribute bytes are handed out through `unsafe` accessors.
//!   Callers must serialize all access to any one slot,
//!   typically by only ever touching slots they allocated themselves.

use crate::alloc_bitmap::{AllocationBitmap, IterSet};
use crate::indexes::{
    BlockId, ColId, SlotOffset, TupleSlot, ALLOC_WORD_BITS, BLOCK_HEADER_SIZE, HEADER_INSERT_HEAD, HEADER_NUM_RECORDS,
};
use crate::layout::BlockLayout;
use crate::raw_block::RawBlock;
use core::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("Block {block_id} is full, all of its {num_slots} slots are allocated")]
    BlockFull { block_id: BlockId, num_slots: u32 },
}

/// Reads and writes tuples in blocks laid out per one [`BlockLayout`].
#[derive(Clone, Copy, Debug)]
pub struct TupleAccessStrategy<'layout> {
    layout: &'layout BlockLayout,
}

impl<'layout> TupleAccessStrategy<'layout> {
    /// Returns a strategy for blocks initialized with `layout`.
    pub fn new(layout: &'layout BlockLayout) -> Self {
        Self { layout }
    }

    /// Returns the layout this strategy interprets blocks with.
    #[inline]
    pub fn layout(&self) -> &'layout BlockLayout {
        self.layout
    }

    /// Returns the byte offset, from the start of a block, of `col`'s null bitmap.
    #[inline]
    pub fn column_null_bitmap(&self, col: ColId) -> usize {
        debug_assert!(col.0 < self.layout.num_cols());
        self.layout.null_bitmap_offset(col)
    }

    /// Returns the byte offset, from the start of a block, of `col`'s value array.
    #[inline]
    pub fn column_start(&self, col: ColId) -> usize {
        debug_assert!(col.0 < self.layout.num_cols());
        self.layout.values_offset(col)
    }

    fn alloc_bitmap<'block>(&self, block: &'block RawBlock) -> AllocationBitmap<'block> {
        let words = block.atomic_words(BLOCK_HEADER_SIZE, self.layout.alloc_bitmap_words());
        AllocationBitmap::new(words, self.layout.num_slots())
    }

    /// Allocates a free slot in `block`.
    ///
    /// Every attribute of the new slot starts out null.
    /// Safe to call from any number of threads at once.
    ///
    /// Returns [`Error::BlockFull`] once every slot of the block is taken.
    pub fn allocate(&self, block: &RawBlock) -> Result<SlotOffset, Error> {
        block.check_layout(self.layout);

        let head = block.atomic_u32(HEADER_INSERT_HEAD);
        let slot = self
            .alloc_bitmap(block)
            .try_allocate_one(head.load(Ordering::Relaxed) as usize)
            .ok_or_else(|| Error::BlockFull {
                block_id: block.block_id(),
                num_slots: self.layout.num_slots(),
            })?;

        // The head is only a hint, so a stale value is fine.
        head.store((slot.idx() / ALLOC_WORD_BITS) as u32, Ordering::Relaxed);
        block.atomic_u32(HEADER_NUM_RECORDS).fetch_add(1, Ordering::Relaxed);

        // The slot is ours alone now, but its null bits share bytes with other slots.
        for col in 0..self.layout.num_cols() {
            let (byte, mask) = self.null_bit(block, ColId(col), slot);
            byte.fetch_and(!mask, Ordering::Release);
        }

        Ok(slot)
    }

    /// Allocates a free slot in `block`, returning it as a [`TupleSlot`].
    ///
    /// See [`TupleAccessStrategy::allocate`].
    pub fn allocate_slot(&self, block: &RawBlock) -> Result<TupleSlot, Error> {
        self.allocate(block)
            .map(|offset| TupleSlot::new(block.block_id(), offset))
    }

    /// Returns the null bitmap byte holding `slot`'s bit for `col` and the mask of that bit.
    #[inline]
    fn null_bit<'block>(&self, block: &'block RawBlock, col: ColId, slot: SlotOffset) -> (&'block AtomicU8, u8) {
        debug_assert!(col.0 < self.layout.num_cols());
        debug_assert!(slot.0 < self.layout.num_slots());
        let idx = slot.idx();
        let byte = block.atomic_u8(self.layout.null_bitmap_offset(col) + idx / 8);
        (byte, 1 << (idx % 8))
    }

    /// Returns the byte range, as offset and length, of `col`'s value for `slot`.
    #[inline]
    fn value_range(&self, col: ColId, slot: SlotOffset) -> (usize, usize) {
        let size = self.layout.attr_size(col);
        (self.layout.values_offset(col) + slot.idx() * size, size)
    }

    /// Marks `col` of `slot` as not null and returns its value bytes for writing.
    ///
    /// The bytes hold whatever was last written to them, or garbage.
    ///
    /// # Safety
    ///
    /// - `block` must have been initialized with this strategy's layout.
    /// - `slot` must be allocated and `col` be a column of the layout.
    /// - No other thread may access `slot`'s values while the returned slice is live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn access_force_not_null<'block>(
        &self,
        block: &'block RawBlock,
        col: ColId,
        slot: SlotOffset,
    ) -> &'block mut [u8] {
        block.debug_check_layout(self.layout);
        debug_assert!(self.is_allocated(block, slot));

        let (byte, mask) = self.null_bit(block, col, slot);
        byte.fetch_or(mask, Ordering::Release);

        let (offset, len) = self.value_range(col, slot);
        // SAFETY: The range lies within `col`'s value array, which is in bounds of the block.
        // Per caller contract, nobody else accesses it while the slice is live.
        unsafe { block.bytes_mut(offset, len) }
    }

    /// Returns the value bytes of `col` for `slot`, or `None` if the value is null.
    ///
    /// # Safety
    ///
    /// - `block` must have been initialized with this strategy's layout.
    /// - `slot` must be allocated and `col` be a column of the layout.
    /// - No other thread may write `slot`'s values while the returned slice is live.
    pub unsafe fn access_with_null_check<'block>(
        &self,
        block: &'block RawBlock,
        col: ColId,
        slot: SlotOffset,
    ) -> Option<&'block [u8]> {
        block.debug_check_layout(self.layout);
        if self.is_null(block, col, slot) {
            return None;
        }

        let (offset, len) = self.value_range(col, slot);
        // SAFETY: The range lies within `col`'s value array, which is in bounds of the block.
        // Per caller contract, nobody writes to it while the slice is live.
        Some(unsafe { block.bytes(offset, len) })
    }

    /// Marks `col` of `slot` as null.
    ///
    /// Leaves the value bytes as they are.
    pub fn set_null(&self, block: &RawBlock, col: ColId, slot: SlotOffset) {
        block.check_layout(self.layout);
        assert!(slot.0 < self.layout.num_slots());
        let (byte, mask) = self.null_bit(block, col, slot);
        byte.fetch_and(!mask, Ordering::Release);
    }

    /// Returns whether `col` of `slot` is null.
    pub fn is_null(&self, block: &RawBlock, col: ColId, slot: SlotOffset) -> bool {
        block.check_layout(self.layout);
        // Past `num_slots`, the byte could belong to a value array.
        assert!(slot.0 < self.layout.num_slots());
        let (byte, mask) = self.null_bit(block, col, slot);
        byte.load(Ordering::Acquire) & mask == 0
    }

    /// Returns whether `slot` has been allocated in `block`.
    pub fn is_allocated(&self, block: &RawBlock, slot: SlotOffset) -> bool {
        block.check_layout(self.layout);
        self.alloc_bitmap(block).is_set(slot)
    }

    /// Returns every slot allocated in `block`, in ascending order.
    pub fn allocated_slots<'block>(&self, block: &'block RawBlock) -> IterSet<'block> {
        block.check_layout(self.layout);
        self.alloc_bitmap(block).iter_set()
    }
}
