//! Provides primitive types and definitions around
//! block sizes, block identifiers, slot offsets and column indices.

use crate::static_assert_size;
use core::fmt;

/// Total size of a block, incl. header, bitmaps and value arrays.
///
/// Defined as one hardware page, 4 KiB.
pub const BLOCK_SIZE: usize = 4096;

/// Size of the fixed part of the block header.
///
/// The allocation bitmap follows directly after it
/// and is accounted for separately as its size depends on the slot count.
pub const BLOCK_HEADER_SIZE: usize = 32;

/// Byte offset of the block identifier within the header.
pub(crate) const HEADER_BLOCK_ID: usize = 0;

/// Byte offset of the number of slots the block was initialized for.
pub(crate) const HEADER_NUM_SLOTS: usize = 8;

/// Byte offset of the number of columns the block was initialized for.
pub(crate) const HEADER_NUM_COLS: usize = 12;

/// Byte offset of the insert head, the word-granular scan start for allocation.
pub(crate) const HEADER_INSERT_HEAD: usize = 16;

/// Byte offset of the count of allocated slots.
pub(crate) const HEADER_NUM_RECORDS: usize = 20;

/// Byte offset of the fingerprint of the layout the block was initialized for.
pub(crate) const HEADER_LAYOUT_FINGERPRINT: usize = 24;

/// Number of bits in one word of the allocation bitmap.
pub const ALLOC_WORD_BITS: usize = u64::BITS as usize;

/// Returns the size in bytes of a per-column null bitmap for `num_slots` slots.
#[inline]
pub const fn null_bitmap_size(num_slots: usize) -> usize {
    num_slots.div_ceil(8)
}

/// Returns the number of 64-bit words the allocation bitmap needs for `num_slots` slots.
#[inline]
pub const fn alloc_bitmap_words(num_slots: usize) -> usize {
    num_slots.div_ceil(ALLOC_WORD_BITS)
}

/// The unique identifier of a block issued by a [`BlockStore`](crate::block_store::BlockStore).
///
/// Identifiers are never reused within one store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct BlockId(pub u64);

static_assert_size!(BlockId, 8);

impl BlockId {
    /// The largest identifier that still fits into a [`TupleSlot`].
    pub const MAX: Self = Self(MASK_BI);

    /// Returns the identifier as a raw `u64`.
    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The offset of a slot within a block, i.e., its index in `0..num_slots`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SlotOffset(pub u32);

static_assert_size!(SlotOffset, 4);

impl SlotOffset {
    /// Returns the offset as a `usize` index.
    #[inline]
    pub const fn idx(self) -> usize {
        self.0 as usize
    }
}

/// The index of a column within a [`BlockLayout`](crate::layout::BlockLayout).
///
/// Column 0 holds the primary / version attribute.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ColId(pub u16);

impl ColId {
    /// The column reserved for the primary / version attribute, which is never null.
    pub const PRIMARY: Self = Self(0);

    /// Returns the column as a `usize` index.
    #[inline]
    pub const fn idx(self) -> usize {
        self.0 as usize
    }
}

impl From<u16> for ColId {
    fn from(col: u16) -> Self {
        Self(col)
    }
}

// Offsets and bits for the components of `TupleSlot`.
const OFFSET_SO: u64 = 0;
const BITS_SO: u64 = 20;
const OFFSET_BI: u64 = OFFSET_SO + BITS_SO;
const BITS_BI: u64 = 44;

// Extracting masks for the components of `TupleSlot`.
const MASK_SO: u64 = (1 << BITS_SO) - 1;
const MASK_BI: u64 = (1 << BITS_BI) - 1;

/// Addresses one tuple: the block it lives in and its slot within that block.
///
/// Packed into 64 bits, the low 20 bits being the slot offset
/// and the high 44 bits the block identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleSlot(pub u64);

static_assert_size!(TupleSlot, 8);

// A block holds at most one slot per byte, so every offset fits.
const _SLOT_OFFSET_FITS: () = assert!(BLOCK_SIZE as u64 <= MASK_SO);

impl TupleSlot {
    /// Returns a tuple slot for `offset` within the block `block_id`.
    #[inline(always)]
    pub const fn new(block_id: BlockId, offset: SlotOffset) -> Self {
        Self(((block_id.0 & MASK_BI) << OFFSET_BI) | ((offset.0 as u64 & MASK_SO) << OFFSET_SO))
    }

    /// Returns the identifier of the block.
    #[inline(always)]
    pub const fn block_id(self) -> BlockId {
        BlockId((self.0 >> OFFSET_BI) & MASK_BI)
    }

    /// Returns the offset within the block.
    #[inline(always)]
    pub const fn offset(self) -> SlotOffset {
        SlotOffset(((self.0 >> OFFSET_SO) & MASK_SO) as u32)
    }
}

impl fmt::Debug for TupleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TupleSlot(block: {}, offset: {})", self.block_id().0, self.offset().0)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn bitmap_sizes_round_up() {
        assert_eq!(null_bitmap_size(1), 1);
        assert_eq!(null_bitmap_size(8), 1);
        assert_eq!(null_bitmap_size(9), 2);
        assert_eq!(alloc_bitmap_words(1), 1);
        assert_eq!(alloc_bitmap_words(64), 1);
        assert_eq!(alloc_bitmap_words(65), 2);
    }

    proptest! {
        #[test]
        fn tuple_slot_ops_work(bi in 0..=MASK_BI, so in 0..BLOCK_SIZE as u32) {
            let slot = TupleSlot::new(BlockId(bi), SlotOffset(so));
            prop_assert_eq!(slot.block_id(), BlockId(bi));
            prop_assert_eq!(slot.offset(), SlotOffset(so));
        }
    }
}
