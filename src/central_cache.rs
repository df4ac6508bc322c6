//! Middle tier: one lockable span list per size class, brokering batches of
//! objects between thread caches and the page cache.
//!
//! A bucket lock and the page-cache lock are never held together: whenever a
//! bucket has to reach the page cache it steps out of its own lock first and
//! re-enters afterwards.

use core::ptr::{NonNull, null_mut};

use parking_lot::{Mutex, MutexGuard};

use crate::{
  AllocError, NUM_FREELISTS,
  block::{FreeBlock, ObjectRange, thread_slots},
  page_cache::PageCache,
  size_class,
  span::{Span, SpanList},
};

pub struct CentralCache {
  buckets: [Mutex<SpanList>; NUM_FREELISTS],
}

impl CentralCache {
  /// The bucket sentinels come from `pages`, which must outlive this cache.
  pub(crate) fn new(pages: &PageCache) -> Result<Self, AllocError> {
    let lists = pages.lock().new_span_lists::<NUM_FREELISTS>()?;
    Ok(Self {
      buckets: lists.map(Mutex::new),
    })
  }

  /// Hands out up to `batch` objects of `bytes` (an aligned size) from a
  /// single span. Fewer come back when that span runs out; `count` says how
  /// many.
  pub fn fetch_range_obj(
    &self,
    pages: &PageCache,
    batch: usize,
    bytes: usize,
  ) -> Result<ObjectRange, AllocError> {
    assert!(batch > 0, "fetching an empty batch");

    let mut list = self.buckets[size_class::index(bytes)].lock();
    let span = Self::get_one_span(&mut list, pages, bytes)?;
    let s = span.as_ptr();

    unsafe {
      let Some(start) = NonNull::new((*s).free) else {
        unreachable!("get_one_span returned a span without free objects");
      };
      let mut end = start;
      let mut count = 1;
      while count < batch {
        let Some(next) = NonNull::new(FreeBlock::next(end)) else {
          break;
        };
        end = next;
        count += 1;
      }

      (*s).free = FreeBlock::next(end);
      FreeBlock::set_next(end, null_mut());
      (*s).use_count += count;

      Ok(ObjectRange { start, end, count })
    }
  }

  /// Returns a span of this bucket with at least one free object, pulling a
  /// fresh one from the page cache when none is left.
  fn get_one_span(
    list: &mut MutexGuard<'_, SpanList>,
    pages: &PageCache,
    bytes: usize,
  ) -> Result<NonNull<Span>, AllocError> {
    if let Some(span) = list
      .iter()
      .find(|span| unsafe { !(*span.as_ptr()).free.is_null() })
    {
      return Ok(span);
    }

    // Nobody else can see the new span until it is pushed, so slicing happens
    // with neither lock held.
    let span = MutexGuard::unlocked(list, || {
      let span = {
        let mut page_cache = pages.lock();
        let span = page_cache.new_span(size_class::num_move_page(bytes))?;
        unsafe { (*span.as_ptr()).obj_size = bytes };
        span
      };
      unsafe { slice_span(span, bytes) };
      crate::trace!(
        "bucket {} took a {} page span for {} byte objects",
        size_class::index(bytes),
        unsafe { (*span.as_ptr()).pages },
        bytes
      );
      Ok::<_, AllocError>(span)
    })?;

    unsafe { list.push_front(span) };
    Ok(span)
  }

  /// Takes back a null-terminated run of `bytes` objects, threading each onto
  /// its owning span. Spans left with nothing checked out go back to the page
  /// cache.
  ///
  /// # Safety
  ///
  /// Every object reachable from `start` must have come from this cache's
  /// `bytes` bucket and must no longer be used by anyone.
  ///
  /// # Panics
  ///
  /// If an object does not belong to any span of `pages`, or a span would be
  /// returned more objects than it handed out.
  pub unsafe fn release_list_to_spans(&self, pages: &PageCache, start: NonNull<FreeBlock>, bytes: usize) {
    let mut list = self.buckets[size_class::index(bytes)].lock();

    let mut cur = start.as_ptr();
    while let Some(obj) = NonNull::new(cur) {
      let next = unsafe { FreeBlock::next(obj) };

      let Some(span) = pages.map_object_to_span(obj.as_ptr().cast()) else {
        panic!("object {obj:p} was not allocated by this heap");
      };
      let s = span.as_ptr();

      unsafe {
        assert!((*s).use_count > 0, "object {obj:p} freed more often than allocated");
        debug_assert_eq!((*s).obj_size, bytes, "object {obj:p} returned to the wrong bucket");

        FreeBlock::set_next(obj, (*s).free);
        (*s).free = obj.as_ptr();
        (*s).use_count -= 1;

        if (*s).use_count == 0 {
          list.erase(span);
          (*s).free = null_mut();
          crate::trace!(
            "bucket {} returned a {} page span",
            size_class::index(bytes),
            (*s).pages
          );
          MutexGuard::unlocked(&mut list, || pages.lock().release_span(span));
        }
      }

      cur = next;
    }
  }

  /// Spans currently held by the bucket of `bytes`.
  pub fn spans_in_bucket(&self, bytes: usize) -> usize {
    self.buckets[size_class::index(bytes)].lock().iter().count()
  }
}

/// Cuts the span's memory into `bytes`-sized slots linked in address order.
/// Trailing bytes too short for a slot are left unused.
///
/// # Safety
///
/// The span must be checked out and visible to nobody else.
unsafe fn slice_span(span: NonNull<Span>, bytes: usize) {
  let s = span.as_ptr();
  unsafe {
    let start = NonNull::new_unchecked((*s).start());
    let count = (*s).bytes() / bytes;
    (*s).free = thread_slots(start, bytes, count);
  }
}
