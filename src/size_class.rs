//! Size-class mapping: request size to aligned size, bucket index and batch
//! quantities. Pure functions, usable in const context.
//!
//! | request range      | alignment | buckets |
//! |--------------------|-----------|---------|
//! | 1 ..= 128          | 8         | 16      |
//! | 129 ..= 1024       | 16        | 56      |
//! | 1025 ..= 8 KiB     | 128       | 56      |
//! | 8 KiB+1 ..= 64 KiB | 1 KiB     | 56      |
//! | 64 KiB+1 ..= 256 KiB | 8 KiB   | 24      |

use crate::{MAX_BYTES, NUM_FREELISTS, PAGE_SHIFT, align_up};

/// Buckets contributed by each alignment tier, smallest tier first.
const GROUP_BUCKETS: [usize; 5] = [16, 56, 56, 56, 24];
const TIER_ALIGN: [usize; 5] = [8, 16, 128, 1024, 8 * 1024];

/// Smallest and largest number of objects moved per thread/central exchange.
const MIN_BATCH: usize = 2;
const MAX_BATCH: usize = 512;

const _: () = assert!(
  GROUP_BUCKETS[0] + GROUP_BUCKETS[1] + GROUP_BUCKETS[2] + GROUP_BUCKETS[3] + GROUP_BUCKETS[4]
    == NUM_FREELISTS
);
const _: () = assert!(index(1) == 0);
const _: () = assert!(index(MAX_BYTES) == NUM_FREELISTS - 1);
const _: () = assert!(round_up(MAX_BYTES) == MAX_BYTES);
const _: () = assert!(class_size(NUM_FREELISTS - 1) == MAX_BYTES);
const _: () = assert!(num_move_size(MAX_BYTES) == MIN_BATCH);
const _: () = assert!(num_move_size(8) == MAX_BATCH);

/// Rounds `bytes` up to the alignment of its tier. Sizes above the small-object
/// ceiling round to whole pages.
#[inline(always)]
pub const fn round_up(bytes: usize) -> usize {
  if bytes <= 128 {
    align_up(bytes, 8)
  } else if bytes <= 1024 {
    align_up(bytes, 16)
  } else if bytes <= 8 * 1024 {
    align_up(bytes, 128)
  } else if bytes <= 64 * 1024 {
    align_up(bytes, 1024)
  } else if bytes <= MAX_BYTES {
    align_up(bytes, 8 * 1024)
  } else {
    align_up(bytes, 1 << PAGE_SHIFT)
  }
}

#[inline(always)]
const fn tier_index(bytes: usize, align_shift: usize) -> usize {
  ((bytes + (1 << align_shift) - 1) >> align_shift) - 1
}

/// Maps `bytes` (1 ..= `MAX_BYTES`) to its free-list bucket.
///
/// # Panics
///
/// If `bytes` is zero or above the small-object ceiling.
#[inline(always)]
pub const fn index(bytes: usize) -> usize {
  assert!(bytes > 0 && bytes <= MAX_BYTES, "size is outside the small-object range");

  if bytes <= 128 {
    tier_index(bytes, 3)
  } else if bytes <= 1024 {
    tier_index(bytes - 128, 4) + GROUP_BUCKETS[0]
  } else if bytes <= 8 * 1024 {
    tier_index(bytes - 1024, 7) + GROUP_BUCKETS[0] + GROUP_BUCKETS[1]
  } else if bytes <= 64 * 1024 {
    tier_index(bytes - 8 * 1024, 10) + GROUP_BUCKETS[0] + GROUP_BUCKETS[1] + GROUP_BUCKETS[2]
  } else {
    tier_index(bytes - 64 * 1024, 13)
      + GROUP_BUCKETS[0]
      + GROUP_BUCKETS[1]
      + GROUP_BUCKETS[2]
      + GROUP_BUCKETS[3]
  }
}

/// Aligned object size served by bucket `index`; the inverse of [`index`]
/// over aligned sizes.
///
/// # Panics
///
/// If `index` is not a bucket.
#[inline]
pub const fn class_size(index: usize) -> usize {
  assert!(index < NUM_FREELISTS, "bucket index out of range");

  let mut base = 0;
  let mut first = 0;
  let mut tier = 0;
  while tier < GROUP_BUCKETS.len() {
    if index < first + GROUP_BUCKETS[tier] {
      return base + (index - first + 1) * TIER_ALIGN[tier];
    }
    base += GROUP_BUCKETS[tier] * TIER_ALIGN[tier];
    first += GROUP_BUCKETS[tier];
    tier += 1;
  }
  unreachable!()
}

/// How many objects of `bytes` move in one batch: `MAX_BYTES / bytes`,
/// clamped to `[2, 512]`.
#[inline(always)]
pub const fn num_move_size(bytes: usize) -> usize {
  assert!(bytes > 0);
  let num = MAX_BYTES / bytes;
  if num < MIN_BATCH {
    MIN_BATCH
  } else if num > MAX_BATCH {
    MAX_BATCH
  } else {
    num
  }
}

/// Pages needed to back one batch of `bytes` objects, at least one.
#[inline(always)]
pub const fn num_move_page(bytes: usize) -> usize {
  let pages = (num_move_size(bytes) * bytes) >> PAGE_SHIFT;
  if pages == 0 { 1 } else { pages }
}
