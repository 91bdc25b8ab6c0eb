//! Large-request bypass.
//!
//! Requests too big for a superblock, over-aligned requests, and requests made
//! while the heaps are unavailable go to a generic system allocator. By default
//! that is the libc `malloc` family. With `c_api` this crate *is* `malloc`, so
//! the bypass maps memory directly instead.

use core::ptr::NonNull;

/// Alignment every bypass allocation satisfies without extra work.
pub(crate) const MIN_ALIGN: usize = 2 * core::mem::size_of::<usize>();

#[inline]
pub(crate) fn alloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
  imp::alloc_aligned(size, align.max(MIN_ALIGN))
}

/// # Safety
/// `ptr` must come from this module and not have been freed.
#[inline]
pub(crate) unsafe fn free(ptr: NonNull<u8>) {
  unsafe { imp::free(ptr) }
}

/// # Safety
/// As for [`free`].
#[inline]
pub(crate) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
  unsafe { imp::usable_size(ptr) }
}

#[cfg(not(feature = "c_api"))]
mod imp {
  use core::ptr::{NonNull, null_mut};

  use super::MIN_ALIGN;

  pub(super) fn alloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    if align <= MIN_ALIGN {
      return NonNull::new(unsafe { libc::malloc(size) }.cast());
    }
    let mut ptr = null_mut();
    match unsafe { libc::posix_memalign(&mut ptr, align, size) } {
      0 => NonNull::new(ptr.cast()),
      _ => None,
    }
  }

  pub(super) unsafe fn free(ptr: NonNull<u8>) {
    unsafe { libc::free(ptr.as_ptr().cast()) };
  }

  #[cfg(target_os = "linux")]
  pub(super) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    unsafe { libc::malloc_usable_size(ptr.as_ptr().cast()) }
  }

  #[cfg(not(target_os = "linux"))]
  pub(super) unsafe fn usable_size(_ptr: NonNull<u8>) -> usize {
    0
  }
}

#[cfg(feature = "c_api")]
mod imp {
  use core::{mem::size_of, ptr::NonNull};

  use crate::{align_up, segment::os_page_size};

  /// Magic number to identify bypass mappings.
  const MAPPING_MAGIC: u64 = 0x4259_5041_5353_4D4D; // "BYPASSMM"

  /// Sits right below the returned pointer.
  #[repr(C)]
  struct MappingHeader {
    base: *mut u8,
    len: usize,
    usable: usize,
    magic: u64,
  }

  const HEADER_SIZE: usize = size_of::<MappingHeader>();

  pub(super) fn alloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    let len = size.checked_add(HEADER_SIZE)?.checked_add(align)?;
    let len = align_up(len, os_page_size());
    let base = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if base == libc::MAP_FAILED {
      return None;
    }
    let base = base as *mut u8;
    let user = align_up(base as usize + HEADER_SIZE, align);
    let header = (user - HEADER_SIZE) as *mut MappingHeader;
    unsafe {
      header.write(MappingHeader {
        base,
        len,
        usable: base as usize + len - user,
        magic: MAPPING_MAGIC,
      });
    }
    NonNull::new(user as *mut u8)
  }

  unsafe fn header(ptr: NonNull<u8>) -> Option<*mut MappingHeader> {
    let header = unsafe { ptr.as_ptr().sub(HEADER_SIZE) }.cast::<MappingHeader>();
    (unsafe { (*header).magic } == MAPPING_MAGIC).then_some(header)
  }

  pub(super) unsafe fn free(ptr: NonNull<u8>) {
    // Foreign pointers are ignored.
    if let Some(header) = unsafe { header(ptr) } {
      unsafe { libc::munmap((*header).base.cast(), (*header).len) };
    }
  }

  pub(super) unsafe fn usable_size(ptr: NonNull<u8>) -> usize {
    unsafe { header(ptr).map_or(0, |header| (*header).usable) }
  }
}
