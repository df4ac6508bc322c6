//! Per-size-class free list of a thread cache.

use core::ptr::{NonNull, null_mut};

use crate::block::{FreeBlock, ObjectRange};

/// Free slots of one size class inside one thread cache, plus the adaptive
/// batch allowance used the next time the bucket runs dry.
pub struct FreeList {
  head: *mut FreeBlock,
  len: usize,
  /// Objects to request from the central cache on the next refill.
  max_size: usize,
}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
      max_size: 1,
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn grow_max_size(&mut self, by: usize) {
    self.max_size += by;
  }

  /// # Safety
  ///
  /// `slot` must be a free slot of this list's size class that nobody else
  /// references.
  #[inline]
  pub unsafe fn push(&mut self, slot: NonNull<u8>) {
    let block = FreeBlock::from_slot(slot);
    unsafe { FreeBlock::set_next(block, self.head) };
    self.head = block.as_ptr();
    self.len += 1;
  }

  /// Pops one slot, or `None` when the list is empty.
  #[inline]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let block = NonNull::new(self.head)?;
    self.head = unsafe { FreeBlock::next(block) };
    self.len -= 1;
    Some(FreeBlock::into_slot(block))
  }

  /// Prepends an already linked run of `count` slots.
  ///
  /// # Safety
  ///
  /// `start ..= end` must be a chain of exactly `count` free slots.
  pub unsafe fn push_range(&mut self, start: NonNull<FreeBlock>, end: NonNull<FreeBlock>, count: usize) {
    unsafe { FreeBlock::set_next(end, self.head) };
    self.head = start.as_ptr();
    self.len += count;
  }

  /// Unlinks the first `count` slots as one null-terminated run.
  ///
  /// # Panics
  ///
  /// If `count` is zero or larger than the list.
  pub fn pop_range(&mut self, count: usize) -> ObjectRange {
    assert!(count > 0, "popping an empty range");
    assert!(count <= self.len, "popping {count} objects from a list of {}", self.len);

    let Some(start) = NonNull::new(self.head) else {
      unreachable!("a list of {} objects has no head", self.len);
    };
    let mut end = start;
    for _ in 1..count {
      let Some(next) = NonNull::new(unsafe { FreeBlock::next(end) }) else {
        panic!("free list is shorter than its length of {}", self.len);
      };
      end = next;
    }

    self.head = unsafe { FreeBlock::next(end) };
    unsafe { FreeBlock::set_next(end, null_mut()) };
    self.len -= count;

    ObjectRange { start, end, count }
  }
}

impl Default for FreeList {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::chain_len;

  fn slots(backing: &mut [u64]) -> Vec<NonNull<u8>> {
    backing
      .iter_mut()
      .map(|word| NonNull::from(word).cast::<u8>())
      .collect()
  }

  #[test]
  fn push_pop_is_lifo() {
    let mut backing = [0u64; 3];
    let slots = slots(&mut backing);
    let mut list = FreeList::new();

    for &slot in &slots {
      unsafe { list.push(slot) };
    }
    assert_eq!(list.len(), 3);

    assert_eq!(list.pop(), Some(slots[2]));
    assert_eq!(list.pop(), Some(slots[1]));
    assert_eq!(list.pop(), Some(slots[0]));
    assert_eq!(list.pop(), None);
    assert!(list.is_empty());
  }

  #[test]
  fn pop_range_detaches_a_terminated_run() {
    let mut backing = [0u64; 5];
    let slots = slots(&mut backing);
    let mut list = FreeList::new();
    for &slot in &slots {
      unsafe { list.push(slot) };
    }

    let range = list.pop_range(3);
    assert_eq!(range.count, 3);
    assert_eq!(FreeBlock::into_slot(range.start), slots[4]);
    assert_eq!(FreeBlock::into_slot(range.end), slots[2]);
    assert_eq!(unsafe { chain_len(range.start.as_ptr()) }, 3);
    assert_eq!(list.len(), 2);

    unsafe { list.push_range(range.start, range.end, range.count) };
    assert_eq!(list.len(), 5);
    let whole = list.pop_range(5);
    assert_eq!(unsafe { chain_len(whole.start.as_ptr()) }, 5);
    assert!(list.is_empty());
  }

  #[test]
  fn allowance_grows_additively() {
    let mut list = FreeList::new();
    assert_eq!(list.max_size(), 1);
    list.grow_max_size(1);
    list.grow_max_size(1);
    assert_eq!(list.max_size(), 3);
  }

  #[test]
  #[should_panic(expected = "popping 2 objects")]
  fn popping_past_the_end_aborts() {
    let mut backing = [0u64; 1];
    let slots = slots(&mut backing);
    let mut list = FreeList::new();
    unsafe { list.push(slots[0]) };
    list.pop_range(2);
  }
}
