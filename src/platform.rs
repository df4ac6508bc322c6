//! Raw page mapping. Everything the allocator owns, including its own control
//! objects, ultimately comes from here.

use core::ptr::{NonNull, null_mut};

use crate::{AllocError, PAGE_SIZE, align_up};

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  if size != 0 {
    unsafe { libc::munmap(ptr.cast(), size) };
  }
}

/// Maps `pages` zeroed pages aligned to `PAGE_SIZE`.
///
/// mmap only promises the hardware page alignment, which is smaller than our
/// page on most targets, so one extra page is mapped and the slack on either
/// side is handed back.
pub fn system_alloc(pages: usize) -> Result<NonNull<u8>, AllocError> {
  debug_assert!(pages > 0);
  let size = pages
    .checked_mul(PAGE_SIZE)
    .ok_or(AllocError::SizeOverflow { size: usize::MAX })?;
  let padded = size
    .checked_add(PAGE_SIZE)
    .ok_or(AllocError::SizeOverflow { size })?;

  let raw = unsafe { os_mmap(padded) };
  if raw.is_null() {
    return Err(AllocError::OutOfMemory { pages });
  }

  let aligned = align_up(raw as usize, PAGE_SIZE);
  let head = aligned - raw as usize;
  let tail = padded - head - size;
  unsafe {
    os_munmap(raw, head);
    os_munmap((aligned + size) as *mut u8, tail);
  }

  crate::trace!("mapped {} pages at {:#x}", pages, aligned);
  NonNull::new(aligned as *mut u8).ok_or(AllocError::OutOfMemory { pages })
}

/// Unmaps a region previously returned by [`system_alloc`].
///
/// # Safety
///
/// `ptr` and `pages` must describe exactly one earlier mapping, and nothing
/// may touch the region afterwards.
pub unsafe fn system_free(ptr: NonNull<u8>, pages: usize) {
  crate::trace!("unmapped {} pages at {:p}", pages, ptr);
  unsafe { os_munmap(ptr.as_ptr(), pages * PAGE_SIZE) };
}
