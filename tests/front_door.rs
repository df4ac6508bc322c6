use std::{collections::HashSet, ptr, thread};

use tierpool::{Heap, MAX_BYTES, NUM_PAGES, PAGE_SIZE, allocate, free};

fn fill(ptr: *mut u8, len: usize, tag: u8) {
  unsafe { ptr::write_bytes(ptr, tag, len) };
}

fn check(ptr: *mut u8, len: usize, tag: u8) {
  let bytes = unsafe { std::slice::from_raw_parts(ptr, len) };
  assert!(bytes.iter().all(|&b| b == tag), "block at {ptr:p} was overwritten");
}

#[test]
fn small_requests_share_a_thread_cache() {
  let sizes = [6, 8, 1, 7, 8, 8, 8];
  let ptrs: Vec<_> = sizes.iter().map(|&size| allocate(size)).collect();

  let mut seen = HashSet::new();
  for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 8, 0);
    assert!(seen.insert(ptr as usize));
    fill(ptr, size, i as u8);
  }
  for (i, (&ptr, &size)) in ptrs.iter().zip(&sizes).enumerate() {
    check(ptr, size, i as u8);
  }

  // All seven land in the 8-byte class.
  let pages = Heap::global().page_cache();
  for &ptr in &ptrs {
    let span = pages.map_object_to_span(ptr).unwrap();
    assert_eq!(unsafe { span.as_ref() }.obj_size(), 8);
  }

  for ptr in ptrs {
    unsafe { free(ptr) };
  }
}

#[test]
fn threads_get_disjoint_blocks() {
  let run = |size: usize, tag: u8| {
    move || {
      let ptrs: Vec<_> = (0..50).map(|_| allocate(size)).collect();
      for &ptr in &ptrs {
        fill(ptr, size, tag);
      }
      thread::yield_now();
      for &ptr in &ptrs {
        check(ptr, size, tag);
      }
      let addrs: Vec<usize> = ptrs.iter().map(|&p| p as usize).collect();
      for ptr in ptrs {
        unsafe { free(ptr) };
      }
      addrs
    }
  };

  let a = thread::spawn(run(6, 0xA1));
  let b = thread::spawn(run(20, 0xB2));
  let a = a.join().unwrap();
  let b = b.join().unwrap();

  assert_eq!(a.iter().collect::<HashSet<_>>().len(), 50);
  assert_eq!(b.iter().collect::<HashSet<_>>().len(), 50);
}

#[test]
fn blocks_freed_on_another_thread() {
  let addrs: Vec<usize> = thread::spawn(|| (0..200).map(|i| allocate(16 + i % 48) as usize).collect())
    .join()
    .unwrap();

  thread::spawn(move || {
    for addr in addrs {
      unsafe { free(addr as *mut u8) };
    }
  })
  .join()
  .unwrap();
}

#[test]
fn large_requests_get_whole_pages() {
  let size = 300 * 1024;
  let ptr = allocate(size);
  assert_eq!(ptr as usize % PAGE_SIZE, 0);
  fill(ptr, size, 0x3C);

  let span = Heap::global().page_cache().map_object_to_span(ptr).unwrap();
  let span = unsafe { span.as_ref() };
  assert!(span.pages() >= 38);
  assert_eq!(span.obj_size(), size);
  assert_eq!(span.start(), ptr);
  check(ptr, size, 0x3C);

  unsafe { free(ptr) };
}

#[test]
fn freed_large_pages_are_reused() {
  let heap = Heap::new().unwrap();
  let mut local = heap.thread_cache().unwrap();

  let first = local.allocate(300 * 1024).unwrap();
  unsafe { local.free(first) };
  let second = local.allocate(300 * 1024).unwrap();
  assert_eq!(first, second);
  unsafe { local.free(second) };
}

#[test]
fn max_bytes_is_still_a_small_request() {
  let heap = Heap::new().unwrap();
  let mut local = heap.thread_cache().unwrap();

  let small = local.allocate(MAX_BYTES).unwrap();
  let span = heap.page_cache().map_object_to_span(small.as_ptr()).unwrap();
  assert_eq!(unsafe { span.as_ref() }.obj_size(), MAX_BYTES);
  assert_eq!(heap.central_cache().spans_in_bucket(MAX_BYTES), 1);

  let large = local.allocate(MAX_BYTES + 1).unwrap();
  let span = heap.page_cache().map_object_to_span(large.as_ptr()).unwrap();
  assert_eq!(unsafe { span.as_ref() }.obj_size(), MAX_BYTES + 1);
  assert_eq!(unsafe { span.as_ref() }.pages(), MAX_BYTES / PAGE_SIZE + 1);

  unsafe {
    local.free(small);
    local.free(large);
  }
}

#[test]
fn oversize_requests_go_back_to_the_os() {
  let heap = Heap::new().unwrap();
  let mut local = heap.thread_cache().unwrap();

  let size = NUM_PAGES * PAGE_SIZE * 2;
  let ptr = local.allocate(size).unwrap();
  fill(ptr.as_ptr(), size, 0x77);
  assert_eq!(ptr.as_ptr() as usize % PAGE_SIZE, 0);

  unsafe { local.free(ptr) };
  assert!(heap.page_cache().map_object_to_span(ptr.as_ptr()).is_none());
}

#[test]
fn zero_size_requests_get_a_block() {
  let a = allocate(0);
  let b = allocate(0);
  assert!(!a.is_null() && !b.is_null());
  assert_ne!(a, b);
  unsafe {
    free(a);
    free(b);
  }
}

#[test]
#[should_panic(expected = "null")]
fn freeing_null_aborts() {
  unsafe { free(ptr::null_mut()) };
}
