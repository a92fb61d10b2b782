// Copyright 2018-2025 the Deno authors. MIT license.

use std::alloc;
use std::alloc::Layout;
use std::ffi::c_void;
use std::ptr::NonNull;

#[derive(Debug, thiserror::Error)]
#[error("Allocation of {size} bytes (alignment {alignment}) failed")]
pub struct ArenaError {
  pub size: usize,
  pub alignment: usize,
}

/// Scoped allocator for one native call. Every argument value, string copy,
/// aggregate, array and out-buffer prepared for the call lives here, at a
/// stable address, until the arena is dropped at the end of the call.
#[derive(Default)]
pub struct ArgArena {
  allocations: Vec<(NonNull<u8>, Layout)>,
}

impl ArgArena {
  pub fn new() -> ArgArena {
    ArgArena::default()
  }

  /// Zero-initialized storage of the given size and alignment. Zero-size
  /// requests are rounded up to one byte so every allocation has a unique,
  /// dereferenceable address.
  pub fn alloc(
    &mut self,
    size: usize,
    alignment: usize,
  ) -> Result<*mut u8, ArenaError> {
    let layout = Layout::from_size_align(size.max(1), alignment)
      .map_err(|_| ArenaError { size, alignment })?;
    Ok(self.alloc_layout(layout))
  }

  fn alloc_layout(&mut self, layout: Layout) -> *mut u8 {
    let layout = layout.pad_to_align();
    let layout = if layout.size() == 0 {
      // A unique, dereferenceable address even for zero-size requests.
      Layout::from_size_align(1, layout.align()).unwrap()
    } else {
      layout
    };
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc::alloc_zeroed(layout) };
    let Some(ptr) = NonNull::new(ptr) else {
      alloc::handle_alloc_error(layout);
    };
    self.allocations.push((ptr, layout));
    ptr.as_ptr()
  }

  /// Aligned storage holding a single primitive value.
  pub fn scalar<T: Copy>(&mut self, value: T) -> *mut u8 {
    let ptr = self.alloc_layout(Layout::new::<T>());
    // SAFETY: freshly allocated for T's size and alignment.
    unsafe { (ptr as *mut T).write(value) };
    ptr
  }

  /// A NUL-terminated copy of `s`. The caller must reject interior NUL
  /// bytes beforehand.
  pub fn string(&mut self, s: &str) -> Result<*mut u8, ArenaError> {
    let bytes = s.as_bytes();
    let ptr = self.alloc(bytes.len() + 1, 1)?;
    // SAFETY: allocated len + 1 bytes above; alloc_zeroed already wrote the
    // terminating NUL.
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    Ok(ptr)
  }

  /// Zero-initialized aggregate storage.
  pub fn aggregate(
    &mut self,
    size: usize,
    alignment: usize,
  ) -> Result<*mut u8, ArenaError> {
    self.alloc(size, alignment)
  }

  /// Zero-initialized storage for a contiguous element run.
  pub fn array(
    &mut self,
    total_size: usize,
    element_alignment: usize,
  ) -> Result<*mut u8, ArenaError> {
    self.alloc(total_size, element_alignment)
  }

  /// A pointer-sized cell holding `ptr`. The call interface expects the
  /// value slot of a pointer argument to address such a cell.
  pub fn indirection(&mut self, ptr: *mut c_void) -> *mut u8 {
    self.scalar(ptr)
  }
}

impl Drop for ArgArena {
  fn drop(&mut self) {
    for (ptr, layout) in self.allocations.drain(..) {
      // SAFETY: allocated by this arena with the recorded layout.
      unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalar_is_aligned_and_initialized() {
    let mut arena = ArgArena::new();
    let ptr = arena.scalar(0x1122334455667788u64);
    assert_eq!(ptr as usize % std::mem::align_of::<u64>(), 0);
    // SAFETY: written just above.
    assert_eq!(unsafe { *(ptr as *const u64) }, 0x1122334455667788);
  }

  #[test]
  fn string_is_nul_terminated() {
    let mut arena = ArgArena::new();
    let ptr = arena.string("hello").unwrap();
    // SAFETY: arena wrote len + 1 bytes.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 6) };
    assert_eq!(bytes, b"hello\0");
  }

  #[test]
  fn aggregate_is_zeroed() {
    let mut arena = ArgArena::new();
    let ptr = arena.aggregate(64, 8).unwrap();
    // SAFETY: 64 bytes allocated above.
    let bytes = unsafe { std::slice::from_raw_parts(ptr, 64) };
    assert!(bytes.iter().all(|&b| b == 0));
  }

  #[test]
  fn zero_size_allocations_are_distinct() {
    let mut arena = ArgArena::new();
    let a = arena.alloc(0, 1).unwrap();
    let b = arena.alloc(0, 1).unwrap();
    assert_ne!(a, b);
  }

  #[test]
  fn indirection_holds_the_pointer() {
    let mut arena = ArgArena::new();
    let target = arena.scalar(7i32);
    let cell = arena.indirection(target as *mut c_void);
    // SAFETY: cell holds a pointer written by indirection().
    assert_eq!(unsafe { *(cell as *const *mut c_void) }, target as *mut c_void);
  }

  #[test]
  fn addresses_are_stable() {
    let mut arena = ArgArena::new();
    let first = arena.scalar(1u8);
    for i in 0..256 {
      arena.scalar(i as u64);
    }
    // SAFETY: first allocation is still owned by the arena.
    assert_eq!(unsafe { *first }, 1);
  }
}
