use core::ops::Range;

/// Shifts `r` forward by `by` bytes, keeping its length.
///
/// Used to place a header field's `0..len` range at its offset.
pub const fn range_move(r: Range<usize>, by: usize) -> Range<usize> {
    (r.start + by)..(r.end + by)
}

/// Fails compilation unless `$ty` is exactly `$size` bytes large.
///
/// ```ignore
/// static_assert_size!(RawBlock, BLOCK_SIZE);
/// ```
#[macro_export]
macro_rules! static_assert_size {
    ($ty:ty, $size:expr) => {
        const _: () = assert!(
            ::core::mem::size_of::<$ty>() == $size,
            concat!("unexpected size of `", stringify!($ty), "`")
        );
    };
}

/// Fails compilation unless `$ty` has an alignment of exactly `$align` bytes.
///
/// ```ignore
/// static_assert_align!(RawBlock, BLOCK_SIZE);
/// ```
#[macro_export]
macro_rules! static_assert_align {
    ($ty:ty, $align:expr) => {
        const _: () = assert!(
            ::core::mem::align_of::<$ty>() == $align,
            concat!("unexpected alignment of `", stringify!($ty), "`")
        );
    };
}
