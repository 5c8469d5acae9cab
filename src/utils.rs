#![allow(clippy::cast_possible_truncation)]

//! Unit and order arithmetic shared by the sub-allocator and the resize engine.

/// Rounds `val` up to a multiple of `align` (any non-zero value).
#[must_use]
pub const fn align_up(val: usize, align: usize) -> usize {
    val.div_ceil(align) * align
}

/// Number of `1 << shift` sized units needed to hold `size` bytes.
#[must_use]
pub const fn units_for(size: u64, shift: u32) -> usize {
    size.div_ceil(1 << shift) as usize
}

/// Smallest `order` such that `1 << order >= units`. `order_of(0) == 0`.
#[must_use]
pub const fn order_of(units: usize) -> u32 {
    if units <= 1 {
        0
    } else {
        usize::BITS - (units - 1).leading_zeros()
    }
}
