//! Intrusive links stored inside free memory.
//!
//! A slot that sits on any free list (a thread cache bucket, a span's embedded
//! list, the bootstrap pool) is viewed as a [`FreeBlock`]: its first machine
//! word holds the address of the next free slot. The word belongs to the
//! allocator only while the slot is free. Once a slot is handed out the
//! caller owns every byte of it and nothing here may read or write it.

use core::ptr::{self, NonNull, null_mut};

/// View of a free slot's leading word.
#[repr(C)]
pub struct FreeBlock {
  next: *mut FreeBlock,
}

impl FreeBlock {
  /// Claims `ptr` as a free slot. The slot must be at least one word long and
  /// word aligned.
  #[inline(always)]
  pub fn from_slot(ptr: NonNull<u8>) -> NonNull<FreeBlock> {
    debug_assert!(ptr.as_ptr() as usize % align_of::<FreeBlock>() == 0);
    ptr.cast()
  }

  #[inline(always)]
  pub fn into_slot(block: NonNull<FreeBlock>) -> NonNull<u8> {
    block.cast()
  }

  /// # Safety
  ///
  /// `block` must point to a slot that is currently free.
  #[inline(always)]
  pub unsafe fn next(block: NonNull<FreeBlock>) -> *mut FreeBlock {
    unsafe { ptr::read(ptr::addr_of!((*block.as_ptr()).next)) }
  }

  /// # Safety
  ///
  /// `block` must point to a slot that is currently free.
  #[inline(always)]
  pub unsafe fn set_next(block: NonNull<FreeBlock>, next: *mut FreeBlock) {
    unsafe { ptr::write(ptr::addr_of_mut!((*block.as_ptr()).next), next) };
  }
}

/// A null-terminated run of free slots moved between tiers in one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectRange {
  pub start: NonNull<FreeBlock>,
  pub end: NonNull<FreeBlock>,
  pub count: usize,
}

/// Walks a null-terminated chain and returns its length.
///
/// # Safety
///
/// Every slot reachable from `start` must be free.
pub unsafe fn chain_len(start: *mut FreeBlock) -> usize {
  let mut len = 0;
  let mut cur = start;
  while let Some(block) = NonNull::new(cur) {
    len += 1;
    cur = unsafe { FreeBlock::next(block) };
  }
  len
}

/// Threads `count` consecutive `stride`-byte slots starting at `base` into a
/// null-terminated chain and returns its head.
///
/// # Safety
///
/// `base .. base + count * stride` must be writable memory owned by the
/// caller, `stride` a multiple of the word size.
pub unsafe fn thread_slots(base: NonNull<u8>, stride: usize, count: usize) -> *mut FreeBlock {
  let mut head = null_mut();
  for i in (0..count).rev() {
    let slot = unsafe { NonNull::new_unchecked(base.as_ptr().add(i * stride)) };
    let block = FreeBlock::from_slot(slot);
    unsafe { FreeBlock::set_next(block, head) };
    head = block.as_ptr();
  }
  head
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn threaded_slots_are_in_address_order() {
    let mut backing = [0u64; 12];
    let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();

    let head = unsafe { thread_slots(base, 24, 4) };
    assert_eq!(head as usize, base.as_ptr() as usize);
    assert_eq!(unsafe { chain_len(head) }, 4);

    let mut cur = head;
    let mut expected = base.as_ptr() as usize;
    while let Some(block) = NonNull::new(cur) {
      assert_eq!(block.as_ptr() as usize, expected);
      expected += 24;
      cur = unsafe { FreeBlock::next(block) };
    }
  }

  #[test]
  fn empty_chain_has_no_length() {
    assert_eq!(unsafe { chain_len(null_mut()) }, 0);
    let mut backing = [0u64; 1];
    let base = NonNull::new(backing.as_mut_ptr().cast::<u8>()).unwrap();
    assert!(unsafe { thread_slots(base, 8, 0) }.is_null());
  }
}
