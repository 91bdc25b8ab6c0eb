//! Processor count and calling-thread identity.

use core::sync::atomic::{AtomicU32, Ordering};

/// Online processors, at least 1.
pub fn processor_count() -> usize {
  let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
  if count < 1 { 1 } else { count as usize }
}

/// Ordinal of the calling thread, assigned on first use and stable for the
/// thread's lifetime. Threads racing with TLS teardown get 0.
pub fn thread_ordinal() -> u32 {
  thread_local! {
    static ORDINAL: u32 = {
      static NEXT: AtomicU32 = AtomicU32::new(0);
      NEXT.fetch_add(1, Ordering::Relaxed) // We only need uniqueness, not synchronization
    };
  }
  ORDINAL.try_with(|&id| id).unwrap_or(0)
}
