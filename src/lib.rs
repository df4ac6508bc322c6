#![allow(clippy::missing_safety_doc)]

//! Three-tier small-object allocator.
//!
//! Requests up to [`MAX_BYTES`] are served from a per-thread cache without
//! locking. Caches refill from, and drain to, a shared central cache holding
//! one span list per size class. The central cache carves spans obtained from
//! the page cache, which manages page runs, splits and coalesces them, and maps
//! fresh memory from the OS. Larger requests go straight to the page cache.

use core::{alloc::Layout, cell::UnsafeCell, ptr::NonNull};
use std::{alloc::handle_alloc_error, sync::OnceLock};

use parking_lot::Mutex;

// =============================================================================
// Tracing
// =============================================================================

/// Writes one line to stderr when the `trace` feature is on; expands to
/// nothing otherwise. Never allocates through this crate.
macro_rules! trace {
  ($($arg:tt)*) => {
    #[cfg(feature = "trace")]
    {
      eprintln!("[tierpool] {}", format_args!($($arg)*));
    }
  };
}
pub(crate) use trace;

pub mod block;
pub mod central_cache;
pub mod error;
pub mod free_list;
pub mod object_pool;
pub mod page_cache;
pub mod page_map;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod thread_cache;

pub use error::AllocError;

use central_cache::CentralCache;
use object_pool::ObjectPool;
use page_cache::PageCache;
use thread_cache::ThreadCache;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT; // 8KB

/// Largest request served by the thread caches.
pub const MAX_BYTES: usize = 256 * 1024;

/// Size-class buckets in every thread cache and in the central cache.
pub const NUM_FREELISTS: usize = 208;

/// Page-cache buckets are indexed by page count; spans of `NUM_PAGES` pages or
/// more bypass them.
pub const NUM_PAGES: usize = 128;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(size_class::num_move_page(MAX_BYTES) < NUM_PAGES);

// =============================================================================
// Heap
// =============================================================================

/// One complete allocator: page cache, central cache, and the pool the
/// per-thread caches are drawn from.
///
/// [`Heap::global`] is the instance behind [`allocate`] and [`free`]. Separate
/// instances are independent; memory from one must never be freed to another.
pub struct Heap {
  // Drop order matters: the central cache's list heads live in the page
  // cache's span pool.
  central: CentralCache,
  caches: Mutex<ObjectPool<ThreadCache>>,
  pages: PageCache,
}

impl Heap {
  pub fn new() -> Result<Self, AllocError> {
    let pages = PageCache::new()?;
    let central = CentralCache::new(&pages)?;
    Ok(Self {
      central,
      caches: Mutex::new(ObjectPool::new()),
      pages,
    })
  }

  /// The process-wide heap, set up on first use.
  pub fn global() -> &'static Heap {
    static HEAP: OnceLock<Heap> = OnceLock::new();
    HEAP.get_or_init(|| match Heap::new() {
      Ok(heap) => heap,
      Err(err) => panic!("failed to set up the global heap: {err}"),
    })
  }

  pub fn page_cache(&self) -> &PageCache {
    &self.pages
  }

  pub fn central_cache(&self) -> &CentralCache {
    &self.central
  }

  /// Draws a fresh thread cache for the calling thread.
  pub fn thread_cache(&self) -> Result<LocalCache<'_>, AllocError> {
    let cache = self.caches.lock().new_object(ThreadCache::new())?;
    Ok(LocalCache { heap: self, cache })
  }

  /// Serves a request above `MAX_BYTES` with a page-aligned span of its own.
  pub fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let bytes = size
      .checked_add(PAGE_SIZE - 1)
      .ok_or(AllocError::SizeOverflow { size })?;
    let k = bytes >> PAGE_SHIFT;

    let mut pages = self.pages.lock();
    let span = pages.new_span(k)?;
    let s = span.as_ptr();
    unsafe {
      (*s).obj_size = size;
      Ok(NonNull::new_unchecked((*s).start()))
    }
  }
}

// =============================================================================
// Thread cache handle
// =============================================================================

/// A thread's front door into a [`Heap`]. Not `Send`: the cache behind it is
/// only ever touched by the thread that drew it.
///
/// Dropping the handle returns every cached object to the central cache.
pub struct LocalCache<'h> {
  heap: &'h Heap,
  cache: NonNull<ThreadCache>,
}

impl LocalCache<'_> {
  /// Returns at least `size` usable bytes. Zero-size requests are served as
  /// one byte. Small blocks are 8-byte aligned, large ones page aligned.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let size = size.max(1);
    if size > MAX_BYTES {
      return self.heap.allocate_large(size);
    }
    let cache = unsafe { &mut *self.cache.as_ptr() };
    cache.allocate(&self.heap.central, &self.heap.pages, size)
  }

  /// Gives back a block. Size and route are recovered from the owning span.
  ///
  /// # Safety
  ///
  /// `ptr` must come from [`allocate`](Self::allocate) on a handle of the same
  /// heap and must not be used again.
  ///
  /// # Panics
  ///
  /// If `ptr` does not point at a live block of this heap.
  pub unsafe fn free(&mut self, ptr: NonNull<u8>) {
    let Some(span) = self.heap.pages.map_object_to_span(ptr.as_ptr()) else {
      panic!("freeing {ptr:p}, which this heap never allocated");
    };
    let s = span.as_ptr();
    let (used, size, start) = unsafe { ((*s).is_used, (*s).obj_size, (*s).start()) };
    assert!(used, "freeing {ptr:p}, which is not allocated");

    if size > MAX_BYTES {
      assert_eq!(start, ptr.as_ptr(), "freeing {ptr:p} from inside a large block");
      unsafe { self.heap.pages.lock().release_span(span) };
    } else {
      let cache = unsafe { &mut *self.cache.as_ptr() };
      unsafe { cache.deallocate(&self.heap.central, &self.heap.pages, ptr, size) };
    }
  }

  /// Objects this handle holds for the size class of `bytes`.
  pub fn cached(&self, bytes: usize) -> usize {
    unsafe { self.cache.as_ref() }.cached(bytes)
  }
}

impl Drop for LocalCache<'_> {
  fn drop(&mut self) {
    unsafe {
      (*self.cache.as_ptr()).flush(&self.heap.central, &self.heap.pages);
      self.heap.caches.lock().delete(self.cache);
    }
  }
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static LOCAL: UnsafeCell<Option<LocalCache<'static>>> = const { UnsafeCell::new(None) };
}

/// Runs `f` with the calling thread's cache of the global heap, drawing one on
/// first use.
fn with_local_cache<R>(f: impl FnOnce(&mut LocalCache<'static>) -> R) -> Result<R, AllocError> {
  match LOCAL.try_with(|slot| slot.get()) {
    Ok(slot) => {
      // Only this thread reaches its slot, and nothing under `f` re-enters it.
      let slot = unsafe { &mut *slot };
      let local = match slot {
        Some(local) => local,
        None => slot.insert(Heap::global().thread_cache()?),
      };
      Ok(f(local))
    }
    // TLS is being torn down; a short-lived cache drains itself on drop.
    Err(_) => {
      let mut local = Heap::global().thread_cache()?;
      Ok(f(&mut local))
    }
  }
}

// =============================================================================
// Front door
// =============================================================================

/// Allocates at least `size` bytes from the global heap.
///
/// Never returns null: running out of memory goes through
/// [`handle_alloc_error`].
pub fn allocate(size: usize) -> *mut u8 {
  match with_local_cache(|local| local.allocate(size)).and_then(|served| served) {
    Ok(ptr) => ptr.as_ptr(),
    Err(_) => {
      let layout = Layout::from_size_align(size.max(1), 1).unwrap_or(Layout::new::<u8>());
      handle_alloc_error(layout)
    }
  }
}

/// Returns a block to the global heap.
///
/// # Safety
///
/// `ptr` must come from [`allocate`] and must not be used again.
///
/// # Panics
///
/// If `ptr` is null or was not handed out by [`allocate`].
pub unsafe fn free(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    panic!("freeing a null pointer");
  };
  if let Err(err) = with_local_cache(|local| unsafe { local.free(ptr) }) {
    panic!("no thread cache to free {ptr:p} into: {err}");
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tierpool_malloc(size: usize) -> *mut u8 {
  allocate(size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tierpool_free(ptr: *mut u8) {
  unsafe { free(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn isolated_heaps_serve_both_routes() {
    let heap = Heap::new().unwrap();
    let mut local = heap.thread_cache().unwrap();

    let small = local.allocate(100).unwrap();
    let large = local.allocate(MAX_BYTES + 1).unwrap();
    assert_eq!(large.as_ptr() as usize % PAGE_SIZE, 0);

    let span = heap.page_cache().map_object_to_span(large.as_ptr()).unwrap();
    assert_eq!(unsafe { span.as_ref() }.obj_size(), MAX_BYTES + 1);
    assert_eq!(unsafe { span.as_ref() }.pages(), MAX_BYTES / PAGE_SIZE + 1);

    unsafe {
      local.free(small);
      local.free(large);
    }
    assert_eq!(local.cached(100), 1);
  }

  #[test]
  fn dropping_a_handle_drains_it() {
    let heap = Heap::new().unwrap();
    {
      let mut local = heap.thread_cache().unwrap();
      let objs: Vec<_> = (0..50).map(|_| local.allocate(64).unwrap()).collect();
      for obj in objs {
        unsafe { local.free(obj) };
      }
    }
    assert_eq!(heap.central_cache().spans_in_bucket(64), 0);
  }

  #[test]
  fn oversized_requests_report_overflow() {
    let heap = Heap::new().unwrap();
    assert_eq!(
      heap.allocate_large(usize::MAX),
      Err(AllocError::SizeOverflow { size: usize::MAX })
    );
  }

  #[test]
  #[should_panic(expected = "never allocated")]
  fn foreign_pointers_abort() {
    let heap = Heap::new().unwrap();
    let mut local = heap.thread_cache().unwrap();
    let mut word = 0u64;
    unsafe { local.free(NonNull::from(&mut word).cast()) };
  }

  #[test]
  #[should_panic(expected = "not allocated")]
  fn double_frees_of_large_blocks_abort() {
    let heap = Heap::new().unwrap();
    let mut local = heap.thread_cache().unwrap();
    let a = local.allocate(64 * PAGE_SIZE).unwrap();
    unsafe {
      local.free(a);
      local.free(a);
    }
  }

  #[test]
  fn align_up_rounds_to_powers_of_two() {
    assert_eq!(align_up(0, 8), 0);
    assert_eq!(align_up(1, 8), 8);
    assert_eq!(align_up(8, 8), 8);
    assert_eq!(align_up(8193, PAGE_SIZE), 2 * PAGE_SIZE);
  }
}
