//! Heaps and fullness-group bins.
//!
//! A heap owns superblocks, each linked into exactly one of
//! [`FULLNESS_GROUPS`] doubly linked bins according to its occupancy. Bin 0
//! holds the emptiest superblocks, the last bin the fullest. The whole heap,
//! including the superblocks it owns, is guarded by one lock.

use core::ptr::null_mut;

use crate::{
  FULLNESS_GROUPS,
  error::HeapViolation,
  lock::{SpinGuard, SpinMutex},
  superblock::{BLOCK_NONE, Superblock, SuperblockHeader},
};

pub(crate) type HeapGuard<'a> = SpinGuard<'a, HeapState>;

/// Snapshot of one heap's accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Heap index; 0 is the global heap.
  pub index: usize,
  /// Bytes in live blocks.
  pub mem_used: usize,
  /// Bytes of block capacity in owned superblocks.
  pub mem_allocated: usize,
  /// Owned superblocks.
  pub superblocks: usize,
  /// Superblocks per fullness group, emptiest first.
  pub bins: [usize; FULLNESS_GROUPS],
}

#[repr(C, align(64))]
pub(crate) struct Heap {
  state: SpinMutex<HeapState>,
}

impl Heap {
  pub(crate) const fn new(index: u32) -> Self {
    Self {
      state: SpinMutex::new(HeapState::new(index)),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> HeapGuard<'_> {
    self.state.lock()
  }
}

pub(crate) struct HeapState {
  index: u32,
  pub(crate) mem_used: usize,
  pub(crate) mem_allocated: usize,
  superblocks: usize,
  bins: [*mut SuperblockHeader; FULLNESS_GROUPS],
}

// Superblock pointers are only followed with the heap lock held.
unsafe impl Send for HeapState {}

/// Walks one bin.
struct BinIter(*mut SuperblockHeader);

impl Iterator for BinIter {
  type Item = Superblock;

  fn next(&mut self) -> Option<Superblock> {
    let sb = Superblock::from_link(self.0)?;
    self.0 = unsafe { (*sb.as_link()).next };
    Some(sb)
  }
}

impl HeapState {
  pub(crate) const fn new(index: u32) -> Self {
    Self {
      index,
      mem_used: 0,
      mem_allocated: 0,
      superblocks: 0,
      bins: [null_mut(); FULLNESS_GROUPS],
    }
  }

  #[inline]
  pub(crate) fn index(&self) -> u32 {
    self.index
  }

  /// No spare block capacity anywhere in the heap.
  #[inline]
  pub(crate) fn is_full(&self) -> bool {
    self.mem_used >= self.mem_allocated
  }

  #[inline]
  fn bin(&self, group: usize) -> BinIter {
    BinIter(self.bins[group])
  }

  /// Pushes `sb` at the head of bin `group`.
  fn link(&mut self, sb: Superblock, group: usize) {
    let head = self.bins[group];
    let h = sb.as_link();
    unsafe {
      (*h).prev = null_mut();
      (*h).next = head;
      if !head.is_null() {
        (*head).prev = h;
      }
    }
    self.bins[group] = h;
    sb.set_group(group);
  }

  fn unlink(&mut self, sb: Superblock) {
    let h = sb.as_link();
    unsafe {
      let (prev, next) = ((*h).prev, (*h).next);
      if prev.is_null() {
        debug_assert_eq!(self.bins[sb.group()], h);
        self.bins[sb.group()] = next;
      } else {
        (*prev).next = next;
      }
      if !next.is_null() {
        (*next).prev = prev;
      }
      (*h).prev = null_mut();
      (*h).next = null_mut();
    }
  }

  /// Moves `sb` to the head of the bin matching its occupancy. Returns `true`
  /// if it changed bins.
  pub(crate) fn rebin(&mut self, sb: Superblock) -> bool {
    let group = sb.fullness_group();
    if group == sb.group() {
      return false;
    }
    self.unlink(sb);
    self.link(sb, group);
    true
  }

  /// Fullest superblock of `class` with a free block.
  pub(crate) fn find(&self, class: u32) -> Option<Superblock> {
    (0..FULLNESS_GROUPS)
      .rev()
      .find_map(|group| self.bin(group).find(|sb| sb.size_class() == class && !sb.is_full()))
  }

  /// Any superblock without live blocks.
  pub(crate) fn find_empty(&self) -> Option<Superblock> {
    self.bin(0).find(|sb| sb.is_empty())
  }

  /// Least occupied superblock, searched in the emptiest non-empty bin.
  pub(crate) fn emptiest(&self) -> Option<Superblock> {
    (0..FULLNESS_GROUPS).find_map(|group| {
      self
        .bin(group)
        .reduce(|best, sb| if sb.emptier_than(best) { sb } else { best })
    })
  }

  /// Takes ownership of an unlinked superblock.
  pub(crate) fn adopt(&mut self, sb: Superblock) {
    sb.set_owner(self.index());
    self.mem_allocated += sb.capacity();
    self.mem_used += sb.live_bytes();
    self.superblocks += 1;
    self.link(sb, sb.fullness_group());
  }

  /// Gives up ownership of `sb`, leaving it unlinked for the next owner.
  pub(crate) fn release(&mut self, sb: Superblock) {
    self.unlink(sb);
    self.mem_allocated -= sb.capacity();
    self.mem_used -= sb.live_bytes();
    self.superblocks -= 1;
  }

  /// Allocates a block from owned superblock `sb` and re-bins it.
  pub(crate) fn allocate(&mut self, sb: Superblock) -> Option<*mut u8> {
    let blk = sb.allocate_block(self);
    if blk == BLOCK_NONE {
      return None;
    }
    self.rebin(sb);
    Some(sb.block_data(blk))
  }

  /// Frees the block at `ptr` inside owned superblock `sb` and re-bins it.
  pub(crate) fn free(&mut self, sb: Superblock, ptr: *mut u8) {
    let blk = sb.block_index(ptr);
    sb.free_block(self, blk);
    self.rebin(sb);
  }

  /// Blowup invariant check: the heap holds more than `slack` bytes of unused
  /// capacity *and* is less than `(GROUPS - 1) / GROUPS` occupied.
  #[inline]
  pub(crate) fn needs_release(&self, slack: usize) -> bool {
    self.mem_used + slack < self.mem_allocated
      && self.mem_used * FULLNESS_GROUPS < self.mem_allocated * (FULLNESS_GROUPS - 1)
  }

  pub(crate) fn stats(&self) -> HeapStats {
    let mut bins = [0; FULLNESS_GROUPS];
    for (group, count) in bins.iter_mut().enumerate() {
      *count = self.bin(group).count();
    }
    HeapStats {
      index: self.index() as usize,
      mem_used: self.mem_used,
      mem_allocated: self.mem_allocated,
      superblocks: self.superblocks,
      bins,
    }
  }

  /// Recomputes the accounting from the bins and checks every superblock's
  /// owner, occupancy and bin.
  pub(crate) fn verify(&self) -> Result<(), HeapViolation> {
    let heap = self.index() as usize;
    let (mut used, mut allocated, mut count) = (0, 0, 0);
    for group in 0..FULLNESS_GROUPS {
      let mut prev = null_mut();
      for sb in self.bin(group) {
        if sb.owner() != self.index() {
          return Err(HeapViolation::Owner {
            heap,
            owner: sb.owner() as usize,
          });
        }
        if sb.block_used() > sb.block_count() {
          return Err(HeapViolation::Overfull {
            heap,
            used: sb.block_used(),
            count: sb.block_count(),
          });
        }
        if sb.group() != group || sb.fullness_group() != group {
          return Err(HeapViolation::Bin {
            heap,
            expected: sb.fullness_group(),
            actual: group,
          });
        }
        if unsafe { (*sb.as_link()).prev } != prev {
          return Err(HeapViolation::Links { heap });
        }
        prev = sb.as_link();
        used += sb.live_bytes();
        allocated += sb.capacity();
        count += 1;
      }
    }
    for (field, expected, actual) in [
      ("mem_used", used, self.mem_used),
      ("mem_allocated", allocated, self.mem_allocated),
      ("superblocks", count, self.superblocks),
    ] {
      if expected != actual {
        return Err(HeapViolation::Accounting {
          heap,
          field,
          expected,
          actual,
        });
      }
    }
    Ok(())
  }
}
