//! Page runs and the intrusive lists that thread them together.

use core::ptr::{NonNull, null_mut};

use crate::{AllocError, PAGE_SHIFT, block::FreeBlock, object_pool::ObjectPool};

/// Page number: an address shifted right by `PAGE_SHIFT`.
pub type PageId = usize;

/// A contiguous run of pages under allocator control.
///
/// Spans are control objects from an [`ObjectPool`] and are reached through
/// raw pointers: the page cache owns the page-range fields and `is_used`, the
/// owning central-cache bucket owns the embedded free list and `use_count`.
#[derive(Debug)]
pub struct Span {
  pub(crate) page_id: PageId,
  pub(crate) pages: usize,
  pub(crate) prev: *mut Span,
  pub(crate) next: *mut Span,
  /// Free object slots carved from this span.
  pub(crate) free: *mut FreeBlock,
  /// Objects currently checked out of this span.
  pub(crate) use_count: usize,
  /// Size the span is sliced into, or the requested size of a large span.
  pub(crate) obj_size: usize,
  /// Checked out of the page cache.
  pub(crate) is_used: bool,
}

impl Span {
  pub const fn new(page_id: PageId, pages: usize) -> Self {
    Self {
      page_id,
      pages,
      prev: null_mut(),
      next: null_mut(),
      free: null_mut(),
      use_count: 0,
      obj_size: 0,
      is_used: false,
    }
  }

  pub fn page_id(&self) -> PageId {
    self.page_id
  }

  pub fn pages(&self) -> usize {
    self.pages
  }

  pub fn use_count(&self) -> usize {
    self.use_count
  }

  pub fn obj_size(&self) -> usize {
    self.obj_size
  }

  pub fn is_used(&self) -> bool {
    self.is_used
  }

  /// First byte of the span's memory.
  #[inline]
  pub fn start(&self) -> *mut u8 {
    (self.page_id << PAGE_SHIFT) as *mut u8
  }

  #[inline]
  pub fn bytes(&self) -> usize {
    self.pages << PAGE_SHIFT
  }
}

/// Intrusive circular doubly-linked list of spans with a sentinel head.
pub struct SpanList {
  head: NonNull<Span>,
}

// Spans are only touched under the lock that guards the owning list.
unsafe impl Send for SpanList {}

impl SpanList {
  /// Builds an empty list whose sentinel comes from `pool`. The sentinel lives
  /// as long as the pool.
  pub fn new(pool: &mut ObjectPool<Span>) -> Result<Self, AllocError> {
    let head = pool.new_object(Span::new(0, 0))?;
    unsafe {
      (*head.as_ptr()).prev = head.as_ptr();
      (*head.as_ptr()).next = head.as_ptr();
    }
    Ok(Self { head })
  }

  /// Builds `N` empty lists, sentinels drawn from `pool`.
  pub fn new_array<const N: usize>(pool: &mut ObjectPool<Span>) -> Result<[SpanList; N], AllocError> {
    let mut heads = [NonNull::dangling(); N];
    for head in &mut heads {
      *head = Self::new(pool)?.head;
    }
    Ok(heads.map(|head| Self { head }))
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    unsafe { (*self.head.as_ptr()).next == self.head.as_ptr() }
  }

  /// Inserts `span` in front of `pos`.
  ///
  /// # Safety
  ///
  /// `pos` must be a member of this list (or its sentinel) and `span` must not
  /// be a member of any list.
  pub unsafe fn insert(&mut self, pos: NonNull<Span>, span: NonNull<Span>) {
    let (pos, span) = (pos.as_ptr(), span.as_ptr());
    unsafe {
      let prev = (*pos).prev;
      (*prev).next = span;
      (*span).prev = prev;
      (*span).next = pos;
      (*pos).prev = span;
    }
  }

  /// # Safety
  ///
  /// `span` must not be a member of any list.
  #[inline]
  pub unsafe fn push_front(&mut self, span: NonNull<Span>) {
    let first = unsafe { NonNull::new_unchecked((*self.head.as_ptr()).next) };
    unsafe { self.insert(first, span) };
  }

  pub fn pop_front(&mut self) -> Option<NonNull<Span>> {
    if self.is_empty() {
      return None;
    }
    let first = unsafe { NonNull::new_unchecked((*self.head.as_ptr()).next) };
    unsafe { self.erase(first) };
    Some(first)
  }

  /// Unlinks `span` from this list.
  ///
  /// # Safety
  ///
  /// `span` must be a member of this list.
  ///
  /// # Panics
  ///
  /// If `span` is the sentinel.
  pub unsafe fn erase(&mut self, span: NonNull<Span>) {
    assert!(span != self.head, "erasing the sentinel of a span list");
    let span = span.as_ptr();
    unsafe {
      let prev = (*span).prev;
      let next = (*span).next;
      (*prev).next = next;
      (*next).prev = prev;
      (*span).prev = null_mut();
      (*span).next = null_mut();
    }
  }

  pub fn iter(&self) -> Iter<'_> {
    Iter {
      list: self,
      cur: unsafe { (*self.head.as_ptr()).next },
    }
  }

  #[cfg(test)]
  pub(crate) fn sentinel(&self) -> NonNull<Span> {
    self.head
  }
}

pub struct Iter<'a> {
  list: &'a SpanList,
  cur: *mut Span,
}

impl Iterator for Iter<'_> {
  type Item = NonNull<Span>;

  fn next(&mut self) -> Option<NonNull<Span>> {
    if self.cur == self.list.head.as_ptr() {
      return None;
    }
    let span = NonNull::new(self.cur)?;
    self.cur = unsafe { (*self.cur).next };
    Some(span)
  }
}
