//! Page id to span lookup: a three-level radix tree whose nodes are mapped
//! straight from the OS.
//!
//! Readers never lock. Writers must hold the page-cache lock, which is what
//! serializes node creation; a node is zeroed memory published with a release
//! store, so a reader either sees it fully or not at all.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
  AllocError, PAGE_SHIFT, PAGE_SIZE,
  platform::{system_alloc, system_free},
  span::{PageId, Span},
};

/// Virtual address bits user space can reach.
const ADDRESS_BITS: usize = if usize::BITS == 64 { 48 } else { 32 };
const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;

const LEAF_BITS: usize = PAGE_ID_BITS / 3;
const MID_BITS: usize = (PAGE_ID_BITS - LEAF_BITS) / 2;
const ROOT_BITS: usize = PAGE_ID_BITS - LEAF_BITS - MID_BITS;

const LEAF_LEN: usize = 1 << LEAF_BITS;
const MID_LEN: usize = 1 << MID_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;

const _: () = assert!(ROOT_BITS + MID_BITS + LEAF_BITS == PAGE_ID_BITS);

#[repr(C)]
struct Leaf {
  spans: [AtomicPtr<Span>; LEAF_LEN],
}

#[repr(C)]
struct Mid {
  leaves: [AtomicPtr<Leaf>; MID_LEN],
}

/// Pages backing one node; mapped memory is zeroed, which is a node of nulls.
const fn node_pages<N>() -> usize {
  size_of::<N>().div_ceil(PAGE_SIZE)
}

pub struct PageMap {
  root: [AtomicPtr<Mid>; ROOT_LEN],
}

impl PageMap {
  pub const fn new() -> Self {
    Self {
      root: [const { AtomicPtr::new(null_mut()) }; ROOT_LEN],
    }
  }

  #[inline(always)]
  const fn split(id: PageId) -> (usize, usize, usize) {
    let leaf = id & (LEAF_LEN - 1);
    let mid = (id >> LEAF_BITS) & (MID_LEN - 1);
    let root = id >> (LEAF_BITS + MID_BITS);
    (root, mid, leaf)
  }

  /// Span covering page `id`, if any.
  #[inline]
  pub fn get(&self, id: PageId) -> Option<NonNull<Span>> {
    let (r, m, l) = Self::split(id);
    let mid = NonNull::new(self.root.get(r)?.load(Ordering::Acquire))?;
    let leaf = NonNull::new(unsafe { mid.as_ref() }.leaves[m].load(Ordering::Acquire))?;
    NonNull::new(unsafe { leaf.as_ref() }.spans[l].load(Ordering::Acquire))
  }

  /// Returns the slot for `id`, creating interior nodes on the way.
  ///
  /// Caller must hold the page-cache lock.
  fn slot(&self, id: PageId) -> Result<&AtomicPtr<Span>, AllocError> {
    let (r, m, l) = Self::split(id);
    assert!(r < ROOT_LEN, "page id {id:#x} is outside the address space");

    let mut mid = self.root[r].load(Ordering::Acquire);
    if mid.is_null() {
      mid = system_alloc(node_pages::<Mid>())?.cast::<Mid>().as_ptr();
      self.root[r].store(mid, Ordering::Release);
    }

    let leaves = unsafe { &(*mid).leaves };
    let mut leaf = leaves[m].load(Ordering::Acquire);
    if leaf.is_null() {
      leaf = system_alloc(node_pages::<Leaf>())?.cast::<Leaf>().as_ptr();
      leaves[m].store(leaf, Ordering::Release);
    }

    Ok(unsafe { &(*leaf).spans[l] })
  }

  /// Points page `id` at `span`. Caller must hold the page-cache lock.
  pub fn set(&self, id: PageId, span: NonNull<Span>) -> Result<(), AllocError> {
    self.slot(id)?.store(span.as_ptr(), Ordering::Release);
    Ok(())
  }

  /// Points every page of `span` at it. Caller must hold the page-cache lock.
  pub fn set_range(&self, span: NonNull<Span>) -> Result<(), AllocError> {
    let (first, pages) = unsafe { ((*span.as_ptr()).page_id, (*span.as_ptr()).pages) };
    for id in first..first + pages {
      self.set(id, span)?;
    }
    Ok(())
  }

  /// Points every page of `span` at it without creating nodes. Used after
  /// coalescing, when every page involved is already mapped.
  ///
  /// # Panics
  ///
  /// If one of the pages was never mapped.
  pub fn remap_range(&self, span: NonNull<Span>) {
    let (first, pages) = unsafe { ((*span.as_ptr()).page_id, (*span.as_ptr()).pages) };
    for id in first..first + pages {
      let (r, m, l) = Self::split(id);
      let mid = self.root[r].load(Ordering::Acquire);
      assert!(!mid.is_null(), "page {id:#x} of a free span was never mapped");
      let leaf = unsafe { (*mid).leaves[m].load(Ordering::Acquire) };
      assert!(!leaf.is_null(), "page {id:#x} of a free span was never mapped");
      unsafe { (*leaf).spans[l].store(span.as_ptr(), Ordering::Release) };
    }
  }

  /// Forgets page `id`. Caller must hold the page-cache lock.
  pub fn clear(&self, id: PageId) {
    let (r, m, l) = Self::split(id);
    let Some(mid) = self.root.get(r).map(|m| m.load(Ordering::Acquire)) else {
      return;
    };
    if mid.is_null() {
      return;
    }
    let leaf = unsafe { (*mid).leaves[m].load(Ordering::Acquire) };
    if !leaf.is_null() {
      unsafe { (*leaf).spans[l].store(null_mut(), Ordering::Release) };
    }
  }
}

impl Default for PageMap {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    for slot in &self.root {
      let Some(mid) = NonNull::new(slot.load(Ordering::Relaxed)) else {
        continue;
      };
      for leaf in unsafe { &mid.as_ref().leaves } {
        if let Some(leaf) = NonNull::new(leaf.load(Ordering::Relaxed)) {
          unsafe { system_free(leaf.cast(), node_pages::<Leaf>()) };
        }
      }
      unsafe { system_free(mid.cast(), node_pages::<Mid>()) };
    }
  }
}
