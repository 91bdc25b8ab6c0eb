//! Superblocks: one page of equal-size blocks with an intrusive free list.
//!
//! ```text
//! page base                                          page base + page_size
//! +--------------------+---------+---------+-----+---------+---------+
//! | SuperblockHeader   | block 0 | block 1 | ... | block n | (slack) |
//! | (64 bytes)         |         |         |     |         |         |
//! +--------------------+---------+---------+-----+---------+---------+
//! ```
//!
//! Blocks are addressed by index. A freed block stores the index of the
//! previously freed block in its first four bytes, so the free list costs no
//! metadata beyond the header. The index field is only touched while the block
//! is free.
//!
//! Every field except `owner` is guarded by the owning heap's lock. `owner` is
//! atomic so the free path can find the heap to lock without holding anything.

use core::{
  mem::size_of,
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU32, Ordering},
};

use crate::{FULLNESS_GROUPS, SIZE_CLASS_MIN, heap::HeapState, size_class::class_size};

pub(crate) type BlockIndex = u32;

/// No block (full superblock, empty free list).
pub(crate) const BLOCK_NONE: BlockIndex = BlockIndex::MAX;

pub(crate) const SUPERBLOCK_HEADER_SIZE: usize = size_of::<SuperblockHeader>();

/// Magic number to identify valid superblock headers.
const SUPERBLOCK_MAGIC: u64 = 0x484F_4152_4453_4221; // "HOARDSB!"

const _: () = assert!(SUPERBLOCK_HEADER_SIZE == 64);
const _: () = assert!(size_of::<BlockIndex>() <= class_size(SIZE_CLASS_MIN));

#[repr(C, align(64))]
pub(crate) struct SuperblockHeader {
  /// Index of the owning heap.
  owner: AtomicU32,
  size_class: u32,
  block_size: u32,
  block_count: u32,
  /// Live blocks.
  block_used: u32,
  /// Watermark: first block never handed out.
  next_block: BlockIndex,
  /// Most recently freed block.
  next_free: BlockIndex,
  /// Bin of the owning heap this superblock is linked into.
  group: u32,
  pub(crate) prev: *mut SuperblockHeader,
  pub(crate) next: *mut SuperblockHeader,
  magic: u64,
}

/// Handle to a superblock header living at the start of a segment page.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Superblock(NonNull<SuperblockHeader>);

/// Bin index for `used` of `count` blocks: `floor(used / count * GROUPS)`,
/// clamped to the last bin.
#[inline]
pub(crate) const fn fullness_group(used: usize, count: usize) -> usize {
  if count == 0 {
    return FULLNESS_GROUPS - 1;
  }
  let group = used * FULLNESS_GROUPS / count;
  if group < FULLNESS_GROUPS {
    group
  } else {
    FULLNESS_GROUPS - 1
  }
}

/// Block size and block count of a `page_size` superblock of `class`.
#[inline]
pub(crate) const fn superblock_layout(page_size: usize, class: u32) -> (usize, usize) {
  let block_size = class_size(class);
  (block_size, (page_size - SUPERBLOCK_HEADER_SIZE) / block_size)
}

impl Superblock {
  /// Writes a fresh header for `class` at `base`.
  ///
  /// # Safety
  /// `base` must be page aligned and point to `page_size` writable bytes that
  /// nothing else references.
  pub(crate) unsafe fn init(base: NonNull<u8>, page_size: usize, owner: u32, class: u32) -> Self {
    let (block_size, block_count) = superblock_layout(page_size, class);
    debug_assert!(block_count > 0);
    let header = base.cast::<SuperblockHeader>();
    unsafe {
      header.as_ptr().write(SuperblockHeader {
        owner: AtomicU32::new(owner),
        size_class: class,
        block_size: block_size as u32,
        block_count: block_count as u32,
        block_used: 0,
        next_block: 0,
        next_free: BLOCK_NONE,
        group: 0,
        prev: null_mut(),
        next: null_mut(),
        magic: SUPERBLOCK_MAGIC,
      });
    }
    Self(header)
  }

  /// Superblock containing the block at `ptr`.
  ///
  /// # Safety
  /// `ptr` must lie inside a superblock page of the segment.
  #[inline]
  pub(crate) unsafe fn containing(ptr: *mut u8, page_size: usize) -> Self {
    let offset = ptr as usize & (page_size - 1);
    unsafe { Self(NonNull::new_unchecked(ptr.sub(offset).cast())) }
  }

  #[inline]
  pub(crate) fn from_link(link: *mut SuperblockHeader) -> Option<Self> {
    NonNull::new(link).map(Self)
  }

  #[inline]
  pub(crate) fn as_link(self) -> *mut SuperblockHeader {
    self.0.as_ptr()
  }

  #[inline]
  pub(crate) fn as_ptr(self) -> *mut u8 {
    self.0.as_ptr().cast()
  }

  /// Switches an empty superblock to another size class. Links and owner are
  /// left alone; callers unlink it first.
  pub(crate) fn reinit(self, page_size: usize, class: u32) {
    let (block_size, block_count) = superblock_layout(page_size, class);
    let h = self.0.as_ptr();
    unsafe {
      debug_assert_eq!((*h).block_used, 0);
      (*h).size_class = class;
      (*h).block_size = block_size as u32;
      (*h).block_count = block_count as u32;
      (*h).next_block = 0;
      (*h).next_free = BLOCK_NONE;
      (*h).group = 0;
    }
  }

  #[inline]
  pub(crate) fn owner(self) -> u32 {
    unsafe { (*self.0.as_ptr()).owner.load(Ordering::Acquire) }
  }

  /// Caller holds the lock of the old and the new owner.
  #[inline]
  pub(crate) fn set_owner(self, heap: u32) {
    unsafe { (*self.0.as_ptr()).owner.store(heap, Ordering::Release) };
  }

  #[inline]
  pub(crate) fn size_class(self) -> u32 {
    unsafe { (*self.0.as_ptr()).size_class }
  }

  #[inline]
  pub(crate) fn block_size(self) -> usize {
    unsafe { (*self.0.as_ptr()).block_size as usize }
  }

  #[inline]
  pub(crate) fn block_count(self) -> usize {
    unsafe { (*self.0.as_ptr()).block_count as usize }
  }

  #[inline]
  pub(crate) fn block_used(self) -> usize {
    unsafe { (*self.0.as_ptr()).block_used as usize }
  }

  /// Bytes of block storage.
  #[inline]
  pub(crate) fn capacity(self) -> usize {
    self.block_size() * self.block_count()
  }

  /// Bytes held by live blocks.
  #[inline]
  pub(crate) fn live_bytes(self) -> usize {
    self.block_size() * self.block_used()
  }

  #[inline]
  pub(crate) fn is_full(self) -> bool {
    self.block_used() >= self.block_count()
  }

  #[inline]
  pub(crate) fn is_empty(self) -> bool {
    self.block_used() == 0
  }

  /// Bin the superblock is currently linked into.
  #[inline]
  pub(crate) fn group(self) -> usize {
    unsafe { (*self.0.as_ptr()).group as usize }
  }

  #[inline]
  pub(crate) fn set_group(self, group: usize) {
    unsafe { (*self.0.as_ptr()).group = group as u32 };
  }

  /// Bin the superblock belongs in given its occupancy.
  #[inline]
  pub(crate) fn fullness_group(self) -> usize {
    fullness_group(self.block_used(), self.block_count())
  }

  /// `true` if `self` is strictly less occupied than `other`.
  #[inline]
  pub(crate) fn emptier_than(self, other: Superblock) -> bool {
    self.block_used() * other.block_count() < other.block_used() * self.block_count()
  }

  #[cfg(any(test, feature = "debug-tripwire"))]
  #[inline]
  pub(crate) fn has_magic(self) -> bool {
    unsafe { (*self.0.as_ptr()).magic == SUPERBLOCK_MAGIC }
  }

  #[inline]
  pub(crate) fn block_data(self, blk: BlockIndex) -> *mut u8 {
    debug_assert!((blk as usize) < self.block_count());
    unsafe {
      self
        .as_ptr()
        .add(SUPERBLOCK_HEADER_SIZE + self.block_size() * blk as usize)
    }
  }

  #[inline]
  pub(crate) fn block_index(self, ptr: *mut u8) -> BlockIndex {
    let offset = ptr as usize - self.as_ptr() as usize - SUPERBLOCK_HEADER_SIZE;
    (offset / self.block_size()) as BlockIndex
  }

  fn freelist_push(self, blk: BlockIndex) {
    let h = self.0.as_ptr();
    unsafe {
      self.block_data(blk).cast::<BlockIndex>().write((*h).next_free);
      (*h).next_free = blk;
    }
  }

  fn freelist_pop(self) -> BlockIndex {
    let h = self.0.as_ptr();
    unsafe {
      let blk = (*h).next_free;
      if blk != BLOCK_NONE {
        (*h).next_free = self.block_data(blk).cast::<BlockIndex>().read();
      }
      blk
    }
  }

  /// Hands out a free block and charges it to `heap`, the locked owner.
  /// Returns [`BLOCK_NONE`] when every block is live.
  pub(crate) fn allocate_block(self, heap: &mut HeapState) -> BlockIndex {
    if self.is_full() {
      return BLOCK_NONE;
    }
    let h = self.0.as_ptr();
    let mut blk = self.freelist_pop();
    unsafe {
      if blk == BLOCK_NONE {
        blk = (*h).next_block;
        (*h).next_block += 1;
      }
      (*h).block_used += 1;
    }
    heap.mem_used += self.block_size();
    blk
  }

  /// Returns live block `blk` to the free list and credits `heap`, the locked
  /// owner. Freeing a block that is not live is undefined.
  pub(crate) fn free_block(self, heap: &mut HeapState, blk: BlockIndex) {
    debug_assert!(self.block_used() > 0);
    self.freelist_push(blk);
    unsafe { (*self.0.as_ptr()).block_used -= 1 };
    heap.mem_used -= self.block_size();
  }

  /// Whether `ptr` is the start of a block that is currently live. Walks the
  /// free list, so only used by the tripwire.
  #[cfg(any(test, feature = "debug-tripwire"))]
  pub(crate) fn is_live_block(self, ptr: *mut u8) -> bool {
    let start = self.as_ptr() as usize + SUPERBLOCK_HEADER_SIZE;
    let addr = ptr as usize;
    if !self.has_magic() || addr < start || (addr - start) % self.block_size() != 0 {
      return false;
    }
    let blk = self.block_index(ptr);
    let h = self.0.as_ptr();
    if blk >= unsafe { (*h).next_block } {
      return false;
    }
    let mut free = unsafe { (*h).next_free };
    while free != BLOCK_NONE {
      if free == blk {
        return false;
      }
      free = unsafe { self.block_data(free).cast::<BlockIndex>().read() };
    }
    true
  }
}
