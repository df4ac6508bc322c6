//! Bootstrap pool for the allocator's own control objects (spans, thread
//! caches, mapping records). Carves fixed-size slots out of chunks mapped
//! straight from the OS and recycles freed slots through an embedded free
//! list, so it never depends on any other allocator.

use core::{
  marker::PhantomData,
  ptr::{NonNull, null_mut},
};

use crate::{
  AllocError, PAGE_SHIFT, PAGE_SIZE, align_up,
  block::FreeBlock,
  platform::{system_alloc, system_free},
};

/// Bytes requested from the OS each time the pool runs dry.
const CHUNK_BYTES: usize = 128 * 1024;

/// Header at the start of every chunk so the pool can unmap them on drop.
#[repr(C)]
struct Chunk {
  next: *mut Chunk,
  pages: usize,
}

pub struct ObjectPool<T> {
  /// Bump cursor into the current chunk.
  memory: *mut u8,
  remaining: usize,
  /// Recycled slots.
  free: *mut FreeBlock,
  chunks: *mut Chunk,
  _marker: PhantomData<T>,
}

// Slots are only reachable through `&mut self`.
unsafe impl<T: Send> Send for ObjectPool<T> {}

impl<T> ObjectPool<T> {
  const SLOT_ALIGN: usize = if align_of::<T>() > align_of::<FreeBlock>() {
    align_of::<T>()
  } else {
    align_of::<FreeBlock>()
  };
  /// A slot must be able to hold the free-list link once recycled.
  const SLOT_SIZE: usize = align_up(
    if size_of::<T>() > size_of::<FreeBlock>() {
      size_of::<T>()
    } else {
      size_of::<FreeBlock>()
    },
    Self::SLOT_ALIGN,
  );
  const HEADER_SIZE: usize = align_up(size_of::<Chunk>(), Self::SLOT_ALIGN);

  pub const fn new() -> Self {
    Self {
      memory: null_mut(),
      remaining: 0,
      free: null_mut(),
      chunks: null_mut(),
      _marker: PhantomData,
    }
  }

  /// Moves `value` into a pool slot.
  pub fn new_object(&mut self, value: T) -> Result<NonNull<T>, AllocError> {
    let slot = match NonNull::new(self.free) {
      Some(block) => {
        self.free = unsafe { FreeBlock::next(block) };
        FreeBlock::into_slot(block)
      }
      None => {
        if self.remaining < Self::SLOT_SIZE {
          self.grow()?;
        }
        let slot = unsafe { NonNull::new_unchecked(self.memory) };
        self.memory = unsafe { self.memory.add(Self::SLOT_SIZE) };
        self.remaining -= Self::SLOT_SIZE;
        slot
      }
    };

    let obj = slot.cast::<T>();
    unsafe { obj.as_ptr().write(value) };
    Ok(obj)
  }

  /// Drops the object and recycles its slot.
  ///
  /// # Safety
  ///
  /// `obj` must come from this pool's [`new_object`](Self::new_object) and
  /// must not be used again.
  pub unsafe fn delete(&mut self, obj: NonNull<T>) {
    unsafe { obj.as_ptr().drop_in_place() };
    let block = FreeBlock::from_slot(obj.cast());
    unsafe { FreeBlock::set_next(block, self.free) };
    self.free = block.as_ptr();
  }

  /// Maps a fresh chunk. Leftover bytes of the previous chunk are abandoned.
  fn grow(&mut self) -> Result<(), AllocError> {
    let bytes = align_up(Self::HEADER_SIZE + Self::SLOT_SIZE, PAGE_SIZE).max(CHUNK_BYTES);
    let pages = bytes >> PAGE_SHIFT;
    let base = system_alloc(pages)?;

    let chunk = base.cast::<Chunk>().as_ptr();
    unsafe {
      chunk.write(Chunk {
        next: self.chunks,
        pages,
      })
    };
    self.chunks = chunk;
    self.memory = unsafe { base.as_ptr().add(Self::HEADER_SIZE) };
    self.remaining = bytes - Self::HEADER_SIZE;
    Ok(())
  }
}

impl<T> Default for ObjectPool<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for ObjectPool<T> {
  /// Unmaps every chunk. Objects still live are not dropped.
  fn drop(&mut self) {
    let mut chunk = self.chunks;
    while let Some(c) = NonNull::new(chunk) {
      unsafe {
        let Chunk { next, pages } = c.as_ptr().read();
        system_free(c.cast(), pages);
        chunk = next;
      }
    }
  }
}
