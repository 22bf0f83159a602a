//! Defines [`BlockLayout`], the geometry of a block holding tuples of fixed-width attributes.
//!
//! A block is laid out as follows:
//!
//! ```text
//! | header (32) | allocation bitmap (8 * ceil(n / 64)) |
//! | col 0 null bitmap (ceil(n / 8)) | col 0 values (n * attr_sizes[0]) |
//! | col 1 null bitmap (ceil(n / 8)) | col 1 values (n * attr_sizes[1]) |
//! | ...                                                                 |
//! | unused tail                                                         |
//! ```
//!
//! where `n` is the number of slots, chosen as the largest value for which
//! everything above the unused tail fits into [`BLOCK_SIZE`].
//! The regions are contiguous and in increasing column order,
//! so no two regions overlap and the last one ends at [`BlockLayout::end_offset`].

use crate::indexes::{alloc_bitmap_words, null_bitmap_size, ColId, BLOCK_HEADER_SIZE, BLOCK_SIZE};
use std::hash::{DefaultHasher, Hash, Hasher};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("A block layout needs at least one column")]
    NoColumns,
    #[error("A block layout supports at most {} columns, but {num_cols} were given", u16::MAX)]
    TooManyColumns { num_cols: usize },
    #[error("Column {col} has an attribute width of zero bytes")]
    ZeroWidthAttr { col: u16 },
    #[error(
        "Cannot fit a single tuple of {num_cols} columns and {row_width} bytes into a block of {} bytes",
        BLOCK_SIZE
    )]
    Infeasible { num_cols: u16, row_width: usize },
}

/// The geometry of a block for a given list of attribute widths.
///
/// A `BlockLayout` is immutable once constructed.
/// It is computed once per distinct list of attribute widths
/// and shared by reference by every block and thread using it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    /// The width of each attribute in bytes, in column order.
    attr_sizes: Box<[u16]>,
    /// The sum of `attr_sizes`.
    row_width: usize,
    /// The number of tuple slots that fit in one block.
    num_slots: u32,
    /// For each column, the byte offset of its null bitmap within the block.
    /// The column's value array starts right after, at `+ null_bitmap_size(num_slots)`.
    null_bitmap_offsets: Box<[u32]>,
    /// One past the last byte used by the layout.
    end_offset: u32,
    /// A hash of `attr_sizes`, stamped into blocks
    /// to tell apart layouts with the same slot and column counts.
    fingerprint: u64,
}

impl BlockLayout {
    /// Computes the layout for tuples with attributes of `attr_sizes` bytes each.
    ///
    /// Column 0 is the primary / version attribute.
    pub fn new(attr_sizes: &[u16]) -> Result<Self, LayoutError> {
        let attr_sizes: Box<[u16]> = attr_sizes.into();
        if attr_sizes.is_empty() {
            return Err(LayoutError::NoColumns);
        }
        let num_cols: u16 = attr_sizes
            .len()
            .try_into()
            .map_err(|_| LayoutError::TooManyColumns {
                num_cols: attr_sizes.len(),
            })?;
        if let Some(col) = attr_sizes.iter().position(|&size| size == 0) {
            return Err(LayoutError::ZeroWidthAttr { col: col as u16 });
        }

        let row_width = attr_sizes.iter().map(|&size| size as usize).sum();
        let num_slots = solve_num_slots(num_cols as usize, row_width);
        if num_slots == 0 {
            return Err(LayoutError::Infeasible { num_cols, row_width });
        }

        // Lay out each column's null bitmap and value array back to back.
        let bitmap_size = null_bitmap_size(num_slots);
        let mut offset = BLOCK_HEADER_SIZE + alloc_bitmap_words(num_slots) * 8;
        let null_bitmap_offsets = attr_sizes
            .iter()
            .map(|&size| {
                let start = offset;
                offset += bitmap_size + num_slots * size as usize;
                start as u32
            })
            .collect();
        debug_assert_eq!(offset, block_bytes_for(num_slots, num_cols as usize, row_width));
        debug_assert!(offset <= BLOCK_SIZE);

        log::debug!(
            "block layout: {num_cols} columns, {row_width} bytes per tuple, \
             {num_slots} slots, {offset} bytes used"
        );

        let fingerprint = fingerprint(&attr_sizes);
        Ok(Self {
            attr_sizes,
            row_width,
            num_slots: num_slots as u32,
            null_bitmap_offsets,
            end_offset: offset as u32,
            fingerprint,
        })
    }

    /// Returns the number of columns.
    #[inline]
    pub fn num_cols(&self) -> u16 {
        self.attr_sizes.len() as u16
    }

    /// Returns the number of tuple slots in a block.
    ///
    /// This is always at least 1.
    #[inline]
    pub fn num_slots(&self) -> u32 {
        self.num_slots
    }

    /// Returns the width, in bytes, of the attribute in `col`.
    #[inline]
    pub fn attr_size(&self, col: ColId) -> usize {
        self.attr_sizes[col.idx()] as usize
    }

    /// Returns the widths of all attributes in column order.
    pub fn attr_sizes(&self) -> &[u16] {
        &self.attr_sizes
    }

    /// Returns the total width, in bytes, of one tuple.
    pub fn row_width(&self) -> usize {
        self.row_width
    }

    /// Returns the size, in bytes, of each column's null bitmap.
    #[inline]
    pub fn null_bitmap_size(&self) -> usize {
        null_bitmap_size(self.num_slots as usize)
    }

    /// Returns the number of 64-bit words in the allocation bitmap.
    #[inline]
    pub fn alloc_bitmap_words(&self) -> usize {
        alloc_bitmap_words(self.num_slots as usize)
    }

    /// Returns the byte offset of `col`'s null bitmap within a block.
    #[inline]
    pub fn null_bitmap_offset(&self, col: ColId) -> usize {
        self.null_bitmap_offsets[col.idx()] as usize
    }

    /// Returns the byte offset of `col`'s value array within a block.
    #[inline]
    pub fn values_offset(&self, col: ColId) -> usize {
        self.null_bitmap_offset(col) + self.null_bitmap_size()
    }

    /// Returns one past the last byte of the block used by this layout.
    pub fn end_offset(&self) -> usize {
        self.end_offset as usize
    }

    /// Returns the fingerprint of the attribute widths.
    ///
    /// Equal widths give equal fingerprints within one process.
    #[inline]
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn fingerprint(attr_sizes: &[u16]) -> u64 {
    let mut hasher = DefaultHasher::new();
    attr_sizes.hash(&mut hasher);
    hasher.finish()
}

/// Returns the number of bytes a block with `num_slots` slots needs
/// for `num_cols` columns whose widths add up to `row_width`.
pub(crate) fn block_bytes_for(num_slots: usize, num_cols: usize, row_width: usize) -> usize {
    let header = BLOCK_HEADER_SIZE + alloc_bitmap_words(num_slots) * 8;
    let bitmaps = num_cols.saturating_mul(null_bitmap_size(num_slots));
    let values = num_slots.saturating_mul(row_width);
    header.saturating_add(bitmaps).saturating_add(values)
}

/// Returns the largest slot count for which the layout fits into a block,
/// or 0 if not even a single slot fits.
fn solve_num_slots(num_cols: usize, row_width: usize) -> usize {
    let fits = |n| block_bytes_for(n, num_cols, row_width) <= BLOCK_SIZE;

    // Each slot costs `row_width` bytes plus one null bit per column and one allocation bit.
    // Ignoring the rounding of bitmaps up to whole bytes and words,
    // this yields an upper bound on the slot count.
    // Rounding only ever adds bytes, so we only need to adjust downwards.
    let bits_per_slot = row_width.saturating_mul(8).saturating_add(num_cols + 1);
    let mut num_slots = (BLOCK_SIZE - BLOCK_HEADER_SIZE) * 8 / bits_per_slot;
    while num_slots > 0 && !fits(num_slots) {
        num_slots -= 1;
    }
    debug_assert!(!fits(num_slots + 1));
    num_slots
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proptest_layout::generate_layout;
    use proptest::prelude::*;

    fn assert_maximal(layout: &BlockLayout) {
        let num_slots = layout.num_slots() as usize;
        let num_cols = layout.num_cols() as usize;
        assert!(num_slots >= 1);
        assert!(block_bytes_for(num_slots, num_cols, layout.row_width()) <= BLOCK_SIZE);
        assert!(block_bytes_for(num_slots + 1, num_cols, layout.row_width()) > BLOCK_SIZE);
    }

    #[test]
    fn three_columns_in_a_page() {
        let layout = BlockLayout::new(&[4, 1, 8]).unwrap();
        assert_eq!(layout.num_cols(), 3);
        assert_eq!(layout.row_width(), 13);
        // 32 + 5 * 8 + 3 * 38 + 300 * 13 = 4086 <= 4096, while 301 slots need 4099 bytes.
        assert_eq!(layout.num_slots(), 300);
        assert_eq!(layout.end_offset(), 4086);
        assert_eq!(layout.null_bitmap_offset(ColId(0)), 72);
        assert_eq!(layout.values_offset(ColId(0)), 72 + 38);
        assert_eq!(layout.null_bitmap_offset(ColId(1)), 72 + 38 + 1200);
        assert_maximal(&layout);
    }

    #[test]
    fn single_widest_column() {
        // 32 + 8 + 1 + 4055 = 4096.
        let layout = BlockLayout::new(&[4055]).unwrap();
        assert_eq!(layout.num_slots(), 1);
        assert_eq!(layout.end_offset(), BLOCK_SIZE);

        assert_eq!(
            BlockLayout::new(&[4056]),
            Err(LayoutError::Infeasible {
                num_cols: 1,
                row_width: 4056
            })
        );
    }

    #[test]
    fn most_one_byte_columns() {
        // 32 + 8 + 2028 * (1 + 1) = 4096.
        let layout = BlockLayout::new(&[1; 2028]).unwrap();
        assert_eq!(layout.num_slots(), 1);
        assert_eq!(layout.end_offset(), BLOCK_SIZE);

        assert!(matches!(
            BlockLayout::new(&[1; 2029]),
            Err(LayoutError::Infeasible { num_cols: 2029, .. })
        ));
    }

    #[test]
    fn invalid_attribute_lists() {
        assert_eq!(BlockLayout::new(&[]), Err(LayoutError::NoColumns));
        assert_eq!(BlockLayout::new(&[8, 0, 4]), Err(LayoutError::ZeroWidthAttr { col: 1 }));
        assert_eq!(
            BlockLayout::new(&vec![1; u16::MAX as usize + 1]),
            Err(LayoutError::TooManyColumns {
                num_cols: u16::MAX as usize + 1
            })
        );
        assert!(matches!(
            BlockLayout::new(&[u16::MAX; 4]),
            Err(LayoutError::Infeasible { num_cols: 4, .. })
        ));
    }

    #[test]
    fn same_shape_layouts_have_different_fingerprints() {
        let a = BlockLayout::new(&[4, 1, 8]).unwrap();
        let b = BlockLayout::new(&[1, 4, 8]).unwrap();
        assert_eq!((a.num_slots(), a.num_cols()), (b.num_slots(), b.num_cols()));
        assert_ne!(a.null_bitmap_offset(ColId(1)), b.null_bitmap_offset(ColId(1)));
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), BlockLayout::new(&[4, 1, 8]).unwrap().fingerprint());
    }

    #[test]
    fn one_byte_single_column_packs_densely() {
        let layout = BlockLayout::new(&[1]).unwrap();
        assert_maximal(&layout);
        // Every slot costs at least a byte, so fewer slots than bytes in the block.
        assert!((layout.num_slots() as usize) < BLOCK_SIZE);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(if cfg!(miri) { 8 } else { 1024 }))]

        #[test]
        fn generated_layouts_are_maximal(layout in generate_layout(1..=64)) {
            assert_maximal(&layout);
        }

        #[test]
        fn regions_are_contiguous_and_in_bounds(layout in generate_layout(1..=64)) {
            let num_slots = layout.num_slots() as usize;
            let mut expected = BLOCK_HEADER_SIZE + layout.alloc_bitmap_words() * 8;
            for col in 0..layout.num_cols() {
                let col = ColId(col);
                prop_assert_eq!(layout.null_bitmap_offset(col), expected);
                prop_assert_eq!(layout.values_offset(col), expected + layout.null_bitmap_size());
                expected = layout.values_offset(col) + num_slots * layout.attr_size(col);
            }
            prop_assert_eq!(layout.end_offset(), expected);
            prop_assert!(expected <= BLOCK_SIZE);
        }
    }
}
