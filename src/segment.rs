//! Backing segment: one reserved mapping handed out page by page.
//!
//! `extend` bumps a break pointer with a CAS loop, so the segment is safe to
//! grow from any thread. Memory handed out is never given back.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{align_up, error::InitError};

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
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Virtual memory page size in bytes.
pub fn os_page_size() -> usize {
  let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
  if size <= 0 { 4096 } else { size as usize }
}

pub struct Segment {
  base: *mut u8,
  /// Bytes reserved (mapped) starting at `base`.
  reserve: usize,
  /// Bytes handed out by `extend`.
  brk: AtomicUsize,
  page_size: usize,
}

unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
  /// An unmapped segment that will reserve `reserve` bytes, rounded up to the
  /// page size, on [`Segment::init`].
  pub fn new(reserve: usize) -> Self {
    let page_size = os_page_size();
    Self {
      base: null_mut(),
      reserve: align_up(reserve, page_size),
      brk: AtomicUsize::new(0),
      page_size,
    }
  }

  /// Maps the reservation. Does nothing if already mapped.
  pub fn init(&mut self) -> Result<(), InitError> {
    if self.is_initialized() {
      return Ok(());
    }
    let base = unsafe { os_mmap(self.reserve) };
    if base.is_null() {
      return Err(InitError::Reserve {
        bytes: self.reserve,
      });
    }
    self.base = base;
    self.brk.store(0, Ordering::Release);
    Ok(())
  }

  #[inline]
  pub fn is_initialized(&self) -> bool {
    self.hi() > self.lo()
  }

  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Low bound of the mapping.
  #[inline]
  pub fn lo(&self) -> *mut u8 {
    self.base
  }

  /// High bound (exclusive) of the mapping.
  #[inline]
  pub fn hi(&self) -> *mut u8 {
    self.base.wrapping_add(if self.base.is_null() { 0 } else { self.reserve })
  }

  /// Bytes handed out so far.
  #[inline]
  pub fn used(&self) -> usize {
    self.brk.load(Ordering::Acquire)
  }

  /// Carves `bytes`, rounded up to whole pages. The result is page aligned.
  /// `None` when the reservation is exhausted.
  pub fn extend(&self, bytes: usize) -> Option<NonNull<u8>> {
    if !self.is_initialized() {
      return None;
    }
    let bytes = align_up(bytes.max(1), self.page_size);
    let offset = self
      .brk
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |brk| {
        brk.checked_add(bytes).filter(|&end| end <= self.reserve)
      })
      .ok()?;
    NonNull::new(unsafe { self.base.add(offset) })
  }

  /// Whether `ptr` lies in memory handed out by `extend`.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let base = self.base as usize;
    let addr = ptr as usize;
    !self.base.is_null() && addr >= base && addr < base + self.used()
  }
}

impl Drop for Segment {
  fn drop(&mut self) {
    if !self.base.is_null() {
      unsafe { os_munmap(self.base, self.reserve) };
    }
  }
}
