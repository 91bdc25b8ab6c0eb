//! Size classes. Class `c` holds blocks of `SIZE_CLASS_BASE^c` bytes.

use crate::{SIZE_CLASS_BASE, SIZE_CLASS_MIN};

const _: () = assert!(SIZE_CLASS_BASE == 2);
const _: () = assert!(SIZE_CLASS_MIN >= 2);

/// Smallest class `c >= SIZE_CLASS_MIN` with `class_size(c) >= size`.
/// A zero-byte request maps like a one-byte request.
#[inline(always)]
pub fn size_class(size: usize) -> u32 {
  let class = match size.max(1).checked_next_power_of_two() {
    Some(pow) => pow.trailing_zeros(),
    None => usize::BITS,
  };
  class.max(SIZE_CLASS_MIN)
}

/// Block size of `class` (inverse of [`size_class`] on powers of two).
#[inline(always)]
pub const fn class_size(class: u32) -> usize {
  1usize << class
}
