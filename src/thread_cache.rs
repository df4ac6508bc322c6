//! Front tier: per-thread free lists, one per size class, touched without any
//! lock.

use core::ptr::NonNull;

use crate::{
  AllocError, MAX_BYTES, NUM_FREELISTS, block::FreeBlock, central_cache::CentralCache,
  free_list::FreeList, page_cache::PageCache, size_class,
};

pub struct ThreadCache {
  lists: [FreeList; NUM_FREELISTS],
}

// Cached objects are owned outright; a cache may be handed to another thread
// as long as only one thread uses it at a time.
unsafe impl Send for ThreadCache {}

impl ThreadCache {
  pub const fn new() -> Self {
    Self {
      lists: [const { FreeList::new() }; NUM_FREELISTS],
    }
  }

  /// Hands out an object of at least `bytes`, refilling the bucket from
  /// `central` when it is empty.
  ///
  /// # Panics
  ///
  /// If `bytes` is zero or above `MAX_BYTES`.
  #[inline]
  pub fn allocate(
    &mut self,
    central: &CentralCache,
    pages: &PageCache,
    bytes: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    assert!(bytes > 0 && bytes <= MAX_BYTES, "{bytes} bytes is not a small size");

    let index = size_class::index(bytes);
    match self.lists[index].pop() {
      Some(obj) => Ok(obj),
      None => self.fetch_from_central_cache(central, pages, index, size_class::round_up(bytes)),
    }
  }

  /// Takes back an object of `bytes`. A bucket that reaches its allowance is
  /// handed back to `central` in full.
  ///
  /// # Safety
  ///
  /// `obj` must come from [`allocate`](Self::allocate) on a cache sharing
  /// `central`, with the same size class, and must not be used again.
  #[inline]
  pub unsafe fn deallocate(&mut self, central: &CentralCache, pages: &PageCache, obj: NonNull<u8>, bytes: usize) {
    assert!(bytes > 0 && bytes <= MAX_BYTES, "{bytes} bytes is not a small size");

    let index = size_class::index(bytes);
    let list = &mut self.lists[index];
    unsafe { list.push(obj) };

    if list.len() >= list.max_size() {
      unsafe { self.release_to_central_cache(central, pages, index, size_class::round_up(bytes)) };
    }
  }

  /// Slow start: a bucket asks for `max_size` objects, capped by the class's
  /// batch limit, and the allowance grows by one each time the cap is not
  /// reached yet.
  #[cold]
  fn fetch_from_central_cache(
    &mut self,
    central: &CentralCache,
    pages: &PageCache,
    index: usize,
    bytes: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let list = &mut self.lists[index];
    let batch = list.max_size().min(size_class::num_move_size(bytes));
    if list.max_size() == batch {
      list.grow_max_size(1);
    }

    let range = central.fetch_range_obj(pages, batch, bytes)?;
    debug_assert!(range.count >= 1 && range.count <= batch);

    if range.count > 1 {
      let Some(second) = NonNull::new(unsafe { FreeBlock::next(range.start) }) else {
        unreachable!("a range of {} objects ends after one", range.count);
      };
      unsafe { list.push_range(second, range.end, range.count - 1) };
    }

    Ok(FreeBlock::into_slot(range.start))
  }

  /// # Safety
  ///
  /// Every object in the bucket must belong to `central`.
  #[cold]
  unsafe fn release_to_central_cache(&mut self, central: &CentralCache, pages: &PageCache, index: usize, bytes: usize) {
    let list = &mut self.lists[index];
    if list.is_empty() {
      return;
    }
    let range = list.pop_range(list.len());
    crate::trace!("thread cache returning {} objects of {} bytes", range.count, bytes);
    unsafe { central.release_list_to_spans(pages, range.start, bytes) };
  }

  /// Hands every cached object back to `central`.
  ///
  /// # Safety
  ///
  /// Every cached object must belong to `central`.
  pub unsafe fn flush(&mut self, central: &CentralCache, pages: &PageCache) {
    for index in 0..NUM_FREELISTS {
      unsafe { self.release_to_central_cache(central, pages, index, size_class::class_size(index)) };
    }
  }

  /// Objects cached for the size class of `bytes`.
  pub fn cached(&self, bytes: usize) -> usize {
    self.lists[size_class::index(bytes)].len()
  }

  /// Current refill allowance for the size class of `bytes`.
  pub fn allowance(&self, bytes: usize) -> usize {
    self.lists[size_class::index(bytes)].max_size()
  }
}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  // Fields drop in order; the central cache goes before the pages it uses.
  struct Tiers {
    central: CentralCache,
    pages: PageCache,
  }

  impl Tiers {
    fn new() -> Self {
      let pages = PageCache::new().unwrap();
      let central = CentralCache::new(&pages).unwrap();
      Self { pages, central }
    }
  }

  #[test]
  fn refills_grow_with_slow_start() {
    let tiers = Tiers::new();
    let mut cache = ThreadCache::new();

    // First miss fetches one object and raises the allowance to two.
    let a = cache.allocate(&tiers.central, &tiers.pages, 6).unwrap();
    assert_eq!(cache.cached(6), 0);
    assert_eq!(cache.allowance(6), 2);

    // Second miss fetches two and keeps one.
    let b = cache.allocate(&tiers.central, &tiers.pages, 8).unwrap();
    assert_eq!(cache.cached(8), 1);
    assert_eq!(cache.allowance(8), 3);
    assert_ne!(a, b);

    // The cached one is served without a refill.
    let c = cache.allocate(&tiers.central, &tiers.pages, 1).unwrap();
    assert_eq!(cache.cached(1), 0);
    assert_eq!(cache.allowance(1), 3);
    assert!(a != c && b != c);
  }

  #[test]
  fn allowance_stops_at_the_batch_limit() {
    let tiers = Tiers::new();
    let mut cache = ThreadCache::new();
    let bytes = crate::MAX_BYTES;
    let limit = size_class::num_move_size(bytes);

    let mut held = Vec::new();
    for _ in 0..6 {
      held.push(cache.allocate(&tiers.central, &tiers.pages, bytes).unwrap());
      while cache.cached(bytes) > 0 {
        held.push(cache.allocate(&tiers.central, &tiers.pages, bytes).unwrap());
      }
    }
    assert_eq!(cache.allowance(bytes), limit + 1);

    for obj in held {
      unsafe { cache.deallocate(&tiers.central, &tiers.pages, obj, bytes) };
    }
    unsafe { cache.flush(&tiers.central, &tiers.pages) };
    assert_eq!(tiers.central.spans_in_bucket(bytes), 0);
  }

  #[test]
  fn long_lists_go_back_to_the_central_cache() {
    let tiers = Tiers::new();
    let mut cache = ThreadCache::new();

    let objs: Vec<_> = (0..10)
      .map(|_| cache.allocate(&tiers.central, &tiers.pages, 48).unwrap())
      .collect();
    let allowance = cache.allowance(48);
    let cached = cache.cached(48);
    assert!(cached < allowance);

    // Frees accumulate until the list reaches the allowance, then it empties.
    let mut freed = 0;
    for &obj in &objs {
      unsafe { cache.deallocate(&tiers.central, &tiers.pages, obj, 48) };
      freed += 1;
      if cached + freed >= allowance {
        break;
      }
      assert_eq!(cache.cached(48), cached + freed);
    }
    assert_eq!(cache.cached(48), 0);
  }

  #[test]
  fn flush_returns_every_span() {
    let tiers = Tiers::new();
    let mut cache = ThreadCache::new();

    let sizes = [8, 100, 1000, 5000, 40_000, 200_000];
    let mut held = Vec::new();
    for &bytes in &sizes {
      for _ in 0..20 {
        held.push((cache.allocate(&tiers.central, &tiers.pages, bytes).unwrap(), bytes));
      }
    }
    for (obj, bytes) in held {
      unsafe { cache.deallocate(&tiers.central, &tiers.pages, obj, bytes) };
    }
    unsafe { cache.flush(&tiers.central, &tiers.pages) };

    for &bytes in &sizes {
      assert_eq!(cache.cached(bytes), 0);
      assert_eq!(tiers.central.spans_in_bucket(bytes), 0, "bytes={bytes}");
    }
  }

  #[test]
  #[should_panic(expected = "not a small size")]
  fn large_sizes_are_rejected() {
    let tiers = Tiers::new();
    let mut cache = ThreadCache::new();
    let _ = cache.allocate(&tiers.central, &tiers.pages, crate::MAX_BYTES + 1);
  }
}
