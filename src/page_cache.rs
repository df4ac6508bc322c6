//! Page-granularity span allocator. One lock guards every free-span bucket,
//! the span pool and all page-map writes; page-map reads are lock-free so a
//! central-cache bucket can resolve objects without touching this lock.

use core::ptr::{NonNull, null_mut};

use parking_lot::{Mutex, MutexGuard};

use crate::{
  AllocError, NUM_PAGES, PAGE_SHIFT,
  object_pool::ObjectPool,
  page_map::PageMap,
  platform::{system_alloc, system_free},
  span::{PageId, Span, SpanList},
};

/// Pages mapped from the OS whenever no free span is large enough: the
/// largest span the buckets manage.
const GROW_PAGES: usize = NUM_PAGES - 1;

/// A region mapped for the buckets, remembered so a dropped cache can unmap it.
struct Mapping {
  base: NonNull<u8>,
  pages: usize,
  next: *mut Mapping,
}

/// State behind the page-cache lock.
struct PageHeap {
  /// `lists[k]` holds the free spans of exactly `k` pages; `lists[0]` stays empty.
  lists: [SpanList; NUM_PAGES],
  spans: ObjectPool<Span>,
  mapping_pool: ObjectPool<Mapping>,
  mappings: *mut Mapping,
}

// Only reachable through the page-cache mutex.
unsafe impl Send for PageHeap {}

impl Drop for PageHeap {
  fn drop(&mut self) {
    let mut cur = self.mappings;
    while let Some(mapping) = NonNull::new(cur) {
      unsafe {
        let Mapping { base, pages, next } = mapping.as_ptr().read();
        system_free(base, pages);
        cur = next;
      }
    }
  }
}

pub struct PageCache {
  heap: Mutex<PageHeap>,
  map: PageMap,
}

impl PageCache {
  pub fn new() -> Result<Self, AllocError> {
    let mut spans = ObjectPool::new();
    let lists = SpanList::new_array(&mut spans)?;
    Ok(Self {
      heap: Mutex::new(PageHeap {
        lists,
        spans,
        mapping_pool: ObjectPool::new(),
        mappings: null_mut(),
      }),
      map: PageMap::new(),
    })
  }

  /// Takes the page-cache lock.
  pub fn lock(&self) -> PageCacheGuard<'_> {
    PageCacheGuard {
      heap: self.heap.lock(),
      map: &self.map,
    }
  }

  /// Span owning the page `ptr` points into. Does not take the lock.
  #[inline]
  pub fn map_object_to_span(&self, ptr: *const u8) -> Option<NonNull<Span>> {
    self.map.get(ptr as usize >> PAGE_SHIFT)
  }
}

pub struct PageCacheGuard<'a> {
  heap: MutexGuard<'a, PageHeap>,
  map: &'a PageMap,
}

impl PageCacheGuard<'_> {
  /// Checks out a span of exactly `k` pages, marked in use.
  ///
  /// Requests of `NUM_PAGES` or more bypass the buckets and map the span
  /// directly. Smaller ones take an exact fit, else split the smallest larger
  /// span, else map a fresh `NUM_PAGES - 1` page span and try once more.
  pub fn new_span(&mut self, k: usize) -> Result<NonNull<Span>, AllocError> {
    assert!(k > 0, "requesting a span of zero pages");

    if k >= NUM_PAGES {
      return self.new_oversize_span(k);
    }

    // The second pass runs right after mapping a span at least `k` pages
    // long, so it cannot come up empty.
    for _ in 0..2 {
      if let Some(span) = self.take_free_span(k)? {
        return Ok(span);
      }
      self.grow()?;
    }
    unreachable!("a fresh {GROW_PAGES}-page span satisfies a {k}-page request")
  }

  fn new_oversize_span(&mut self, k: usize) -> Result<NonNull<Span>, AllocError> {
    let base = system_alloc(k)?;
    let page_id = base.as_ptr() as usize >> PAGE_SHIFT;
    let span = match self.heap.spans.new_object(Span::new(page_id, k)) {
      Ok(span) => span,
      Err(err) => {
        unsafe { system_free(base, k) };
        return Err(err);
      }
    };
    unsafe { (*span.as_ptr()).is_used = true };
    // Only the first page is mapped; frees always hand back the start address.
    self.map.set(page_id, span)?;
    crate::trace!("oversize span of {} pages at page {:#x}", k, page_id);
    Ok(span)
  }

  fn take_free_span(&mut self, k: usize) -> Result<Option<NonNull<Span>>, AllocError> {
    let heap = &mut *self.heap;

    if let Some(span) = heap.lists[k].pop_front() {
      // Remap in case merges left ids pointing at a neighbour.
      self.map.set_range(span)?;
      unsafe { (*span.as_ptr()).is_used = true };
      return Ok(Some(span));
    }

    let Some(i) = (k + 1..NUM_PAGES).find(|&i| !heap.lists[i].is_empty()) else {
      return Ok(None);
    };
    let Some(big) = heap.lists[i].pop_front() else {
      return Ok(None);
    };
    let big_ptr = big.as_ptr();
    let span = match heap.spans.new_object(Span::new(unsafe { (*big_ptr).page_id }, k)) {
      Ok(span) => span,
      Err(err) => {
        unsafe { heap.lists[i].push_front(big) };
        return Err(err);
      }
    };

    // The remainder keeps its page-map entries; only the carved head moves.
    unsafe {
      (*big_ptr).page_id += k;
      (*big_ptr).pages -= k;
      heap.lists[(*big_ptr).pages].push_front(big);
      (*span.as_ptr()).is_used = true;
    }
    self.map.set_range(span)?;
    Ok(Some(span))
  }

  /// Maps a maximum-size span from the OS into its bucket.
  fn grow(&mut self) -> Result<(), AllocError> {
    let base = self.map_region(GROW_PAGES)?;
    let page_id = base.as_ptr() as usize >> PAGE_SHIFT;
    self.add_free_span(page_id, GROW_PAGES)?;
    crate::trace!("page cache grew by {} pages at page {:#x}", GROW_PAGES, page_id);
    Ok(())
  }

  /// Maps `pages` from the OS, remembered so dropping the cache unmaps them.
  fn map_region(&mut self, pages: usize) -> Result<NonNull<u8>, AllocError> {
    let heap = &mut *self.heap;
    let base = system_alloc(pages)?;
    let record = Mapping {
      base,
      pages,
      next: heap.mappings,
    };
    let mapping = match heap.mapping_pool.new_object(record) {
      Ok(mapping) => mapping,
      Err(err) => {
        unsafe { system_free(base, pages) };
        return Err(err);
      }
    };
    heap.mappings = mapping.as_ptr();
    Ok(base)
  }

  /// Files `pages` pages starting at `page_id` as one free span.
  fn add_free_span(&mut self, page_id: PageId, pages: usize) -> Result<(), AllocError> {
    let heap = &mut *self.heap;
    let span = heap.spans.new_object(Span::new(page_id, pages))?;
    self.map.set_range(span)?;
    unsafe { heap.lists[pages].push_front(span) };
    Ok(())
  }

  /// Files one mapping as two free maximum-size spans that touch, returning
  /// the first page. Separate `grow` regions only touch when the OS happens to
  /// place them so.
  #[cfg(test)]
  fn seed_adjacent_spans(&mut self) -> Result<PageId, AllocError> {
    let base = self.map_region(2 * GROW_PAGES)?;
    let first = base.as_ptr() as usize >> PAGE_SHIFT;
    self.add_free_span(first, GROW_PAGES)?;
    self.add_free_span(first + GROW_PAGES, GROW_PAGES)?;
    Ok(first)
  }

  /// Takes back a span nobody references any more.
  ///
  /// Oversize spans go straight back to the OS. Others absorb free
  /// page-adjacent neighbours, first backwards then forwards, while the
  /// result stays below `NUM_PAGES`, and land in the bucket of their final
  /// size.
  ///
  /// # Safety
  ///
  /// `span` must have come from [`new_span`](Self::new_span) of this cache,
  /// be unlinked from every list, and have no objects checked out.
  pub unsafe fn release_span(&mut self, span: NonNull<Span>) {
    let s = span.as_ptr();
    let heap = &mut *self.heap;

    if unsafe { (*s).pages } >= NUM_PAGES {
      let (page_id, pages, start) = unsafe { ((*s).page_id, (*s).pages, (*s).start()) };
      self.map.clear(page_id);
      crate::trace!("oversize span of {} pages at page {:#x} unmapped", pages, page_id);
      unsafe {
        system_free(NonNull::new_unchecked(start), pages);
        heap.spans.delete(span);
      }
      return;
    }

    // Backwards: the page just before our first one.
    while let Some(prev) = unsafe { (*s).page_id }
      .checked_sub(1)
      .and_then(|id| self.map.get(id))
    {
      let p = prev.as_ptr();
      unsafe {
        if (*p).is_used || (*p).pages + (*s).pages >= NUM_PAGES {
          break;
        }
        crate::trace!("merging {} pages before page {:#x}", (*p).pages, (*s).page_id);
        (*s).page_id = (*p).page_id;
        (*s).pages += (*p).pages;
        heap.lists[(*p).pages].erase(prev);
        heap.spans.delete(prev);
      }
    }

    // Forwards: the page just past our last one.
    while let Some(next) = self.map.get(unsafe { (*s).page_id + (*s).pages }) {
      let n = next.as_ptr();
      unsafe {
        if (*n).is_used || (*n).pages + (*s).pages >= NUM_PAGES {
          break;
        }
        crate::trace!("merging {} pages after page {:#x}", (*n).pages, (*s).page_id);
        (*s).pages += (*n).pages;
        heap.lists[(*n).pages].erase(next);
        heap.spans.delete(next);
      }
    }

    unsafe {
      (*s).is_used = false;
      (*s).free = null_mut();
      (*s).use_count = 0;
      (*s).obj_size = 0;
      heap.lists[(*s).pages].push_front(span);
    }
    self.map.remap_range(span);
  }

  /// Empty span lists whose sentinels come from this cache's span pool.
  pub fn new_span_lists<const N: usize>(&mut self) -> Result<[SpanList; N], AllocError> {
    SpanList::new_array(&mut self.heap.spans)
  }

  /// Number of free spans of exactly `k` pages.
  pub fn free_spans(&self, k: usize) -> usize {
    self.heap.lists[k].iter().count()
  }

  /// Page ids covered by free spans of exactly `k` pages.
  pub fn free_span_ranges(&self, k: usize) -> impl Iterator<Item = (PageId, usize)> + '_ {
    self.heap.lists[k]
      .iter()
      .map(|span| unsafe { ((*span.as_ptr()).page_id, (*span.as_ptr()).pages) })
  }
}
