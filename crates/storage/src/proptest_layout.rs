//! Proptest generators for block layouts and the tuples they hold.

use crate::layout::BlockLayout;
use proptest::{
    collection::{vec, SizeRange},
    prelude::*,
    prop_oneof,
    strategy::{Just, Strategy},
};

/// Generates attribute widths, mostly those of machine integers.
fn generate_attr_size() -> impl Strategy<Value = u16> {
    prop_oneof![
        4 => prop_oneof![Just(1u16), Just(2), Just(4), Just(8)],
        1 => 1..=256u16,
    ]
}

/// Generates attribute width lists with a number of columns in `num_cols`.
pub fn generate_attr_sizes(num_cols: impl Into<SizeRange>) -> impl Strategy<Value = Vec<u16>> {
    vec(generate_attr_size(), num_cols)
}

/// Generates layouts with a number of columns in `num_cols`.
///
/// Width lists which cannot fit a single tuple into a block are rejected.
pub fn generate_layout(num_cols: impl Into<SizeRange>) -> impl Strategy<Value = BlockLayout> {
    generate_attr_sizes(num_cols).prop_filter_map("tuple does not fit into a block", |attr_sizes| {
        BlockLayout::new(&attr_sizes).ok()
    })
}

/// Generates a layout together with one tuple of values for it,
/// each column either `None`, i.e. null, or bytes of the column's width.
///
/// The primary column is never null.
pub fn generate_layout_and_tuple(
    num_cols: impl Into<SizeRange>,
) -> impl Strategy<Value = (BlockLayout, Vec<Option<Vec<u8>>>)> {
    generate_layout(num_cols).prop_flat_map(|layout| {
        let columns: Vec<_> = layout
            .attr_sizes()
            .iter()
            .enumerate()
            .map(|(col, &size)| {
                let bytes = vec(any::<u8>(), size as usize);
                if col == 0 {
                    bytes.prop_map(Some).boxed()
                } else {
                    proptest::option::of(bytes).boxed()
                }
            })
            .collect();
        (Just(layout), columns)
    })
}
