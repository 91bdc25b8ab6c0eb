//! Heap mutex.
//!
//! A spin-then-yield lock. It never allocates, so it is safe to take from
//! inside the global allocator, and it never fails: `lock` blocks until the
//! holder releases.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Busy-wait iterations before falling back to `sched_yield`.
const SPINS_BEFORE_YIELD: u32 = 64;

pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) {
    let mut spins = 0;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          std::thread::yield_now();
        }
      }
    }
  }

  #[inline]
  pub(crate) fn unlock(&self) {
    self.locked.store(false, Ordering::Release);
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }
}

/// Data guarded by a [`SpinLock`]. Access only through [`SpinGuard`].
pub(crate) struct SpinMutex<T> {
  lock: SpinLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
  pub(crate) const fn new(data: T) -> Self {
    Self {
      lock: SpinLock::new(),
      data: UnsafeCell::new(data),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
    self.lock.lock();
    SpinGuard { mutex: self }
  }

  #[cfg(test)]
  pub(crate) fn is_locked(&self) -> bool {
    self.lock.is_locked()
  }
}

pub(crate) struct SpinGuard<'a, T> {
  mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  #[inline]
  fn deref(&self) -> &T {
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  #[inline]
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.mutex.lock.unlock();
  }
}
