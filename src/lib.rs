#![allow(clippy::missing_safety_doc)]
//! A Hoard-style multithreaded memory allocator.
//!
//! Small requests are served from page-sized superblocks owned by per-thread
//! processor heaps. Superblocks that fall mostly empty migrate to a shared
//! global heap where other heaps can pick them up, which bounds the memory
//! held by any one heap. Requests larger than half a page go to the system
//! allocator.
//!
//! [`Context`] is the engine and can be constructed explicitly. The free
//! functions and [`Allocator`] drive one process-wide context.
//!
//! ```no_run
//! #[global_allocator]
//! static GLOBAL: hoardalloc::Allocator = hoardalloc::Allocator;
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::sync::OnceLock;

mod config;
mod context;
mod error;
mod heap;
mod lock;
pub mod runtime;
mod segment;
mod size_class;
mod superblock;
mod system;

pub use config::Config;
pub use context::{Context, GLOBAL_HEAP, MAX_BLOCK_ALIGN};
pub use error::{HeapViolation, InitError};
pub use heap::HeapStats;
pub use segment::{Segment, os_page_size};
pub use size_class::{class_size, size_class};

// =============================================================================
// Constants
// =============================================================================

/// Occupancy bins per heap.
pub const FULLNESS_GROUPS: usize = 4;
/// Size classes are powers of this base.
pub const SIZE_CLASS_BASE: usize = 2;
/// Smallest size class (4-byte blocks hold a block index).
pub const SIZE_CLASS_MIN: u32 = 2;
/// Processor heaps per virtual processor.
pub const HEAP_CPU_FACTOR: usize = 2;

const _: () = assert!(FULLNESS_GROUPS >= 2);
const _: () = assert!(HEAP_CPU_FACTOR >= 1);
const _: () = assert!(MAX_BLOCK_ALIGN.is_power_of_two());

// =============================================================================
// Process-wide context
// =============================================================================

static CONTEXT: ContextCell = OnceLock::new();

thread_local! {
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` with the reentrancy flag set. `None` when already inside the
/// allocator on this thread or when TLS is gone.
fn guarded<R, F: FnOnce() -> R>(f: F) -> Option<R> {
  let entered = IN_ALLOC
    .try_with(|flag| !flag.replace(true))
    .unwrap_or(false);
  if !entered {
    return None;
  }
  let result = f();
  let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  Some(result)
}

type ContextCell = OnceLock<Result<Context, InitError>>;

fn build_in(cell: &ContextCell, config: Config) -> &Result<Context, InitError> {
  cell.get_or_init(|| {
    let context = Context::new(config);
    if let Err(err) = &context {
      log::error!("allocator initialization failed: {err}");
    }
    context
  })
}

fn build_context() -> &'static Result<Context, InitError> {
  build_in(&CONTEXT, Config::default())
}

fn initialize_in(cell: &ContextCell, config: Config) -> Result<(), InitError> {
  guarded(|| build_in(cell, config).as_ref().map(|_| ()).map_err(|err| *err))
    .unwrap_or(Err(InitError::Unavailable))
}

/// The process-wide context, if it has been built successfully.
pub fn context() -> Option<&'static Context> {
  CONTEXT.get().and_then(|context| context.as_ref().ok())
}

/// Builds the process-wide context. Later calls return the first outcome.
pub fn initialize() -> Result<(), InitError> {
  initialize_in(&CONTEXT, Config::default())
}

fn allocate_aligned(size: usize, align: usize) -> *mut u8 {
  let ptr = guarded(|| match build_context() {
    Ok(context) => context.allocate_aligned(size, align),
    Err(_) => system::alloc_aligned(size.max(1), align),
  });
  ptr
    .unwrap_or_else(|| system::alloc_aligned(size.max(1), align))
    .map_or(null_mut(), NonNull::as_ptr)
}

/// Allocates `size` bytes aligned to at least `min(block size, 64)`.
/// Null on failure.
pub unsafe fn allocate(size: usize) -> *mut u8 {
  allocate_aligned(size, 1)
}

/// Frees memory from [`allocate`]. Null is a no-op.
pub unsafe fn deallocate(ptr: *mut u8) {
  let Some(ptr) = NonNull::new(ptr) else {
    return;
  };
  // The segment only ever grows, so a pointer outside it, including one from
  // a reentrant call, belongs to the system allocator.
  match context() {
    Some(context) => unsafe { context.deallocate(ptr) },
    None => unsafe { system::free(ptr) },
  }
}

/// Usable bytes at `ptr`. Zero for null.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  let Some(ptr) = NonNull::new(ptr) else {
    return 0;
  };
  match context() {
    Some(context) => unsafe { context.usable_size(ptr) },
    None => unsafe { system::usable_size(ptr) },
  }
}

/// Same-class check for in-place `realloc`.
fn same_block(ptr: *mut u8, layout: Layout, new_size: usize) -> bool {
  let Some(context) = context() else {
    return false;
  };
  if !context.contains(ptr) {
    return false;
  }
  let old = layout.size().max(layout.align());
  let new = new_size.max(layout.align());
  new <= context.small_limit() && size_class(old.max(1)) == size_class(new.max(1))
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  #[inline]
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    allocate_aligned(layout.size(), layout.align())
  }

  #[inline]
  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    unsafe { deallocate(ptr) }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if same_block(ptr, layout, new_size) {
      return ptr;
    }

    let new_ptr = allocate_aligned(new_size, layout.align());
    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { deallocate(ptr) };
    }
    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      // Recycled blocks are dirty.
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  allocate_aligned(size, system::MIN_ALIGN)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { deallocate(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = allocate_aligned(total, system::MIN_ALIGN);
  if !ptr.is_null() {
    unsafe { ptr::write_bytes(ptr, 0, total) };
  }
  ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  if ptr.is_null() {
    return allocate_aligned(size, system::MIN_ALIGN);
  }

  if size == 0 {
    unsafe { deallocate(ptr) };
    return null_mut();
  }

  let old_size = unsafe { usable_size(ptr) };
  if size <= old_size && context().is_some_and(|c| c.contains(ptr)) {
    return ptr;
  }

  let new_ptr = allocate_aligned(size, system::MIN_ALIGN);
  if !new_ptr.is_null() {
    unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, old_size.min(size)) };
    unsafe { deallocate(ptr) };
  }
  new_ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  let ptr = allocate_aligned(size, alignment);
  if ptr.is_null() {
    return libc::ENOMEM;
  }

  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { usable_size(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
