//! Allocator state: the heap table over one segment.
//!
//! ```text
//! segment: | heap table (page aligned) | superblock | superblock | ...
//! heaps:   [ global | proc 1 | proc 2 | ... | proc N ]
//! ```
//!
//! # Lock ordering
//!
//! A thread holds at most two heap locks, and only through
//! [`Context::lock_pair`], which always acquires the lower heap index first.
//! The global heap is index 0, so it is always taken before a processor heap.
//! Code holding a single processor heap lock that needs the global heap drops
//! its lock first and re-validates after `lock_pair`.

use core::{mem::size_of, ptr::NonNull, slice};

use log::{debug, trace, warn};

use crate::{
  align_up,
  config::Config,
  error::{HeapViolation, InitError},
  heap::{Heap, HeapGuard, HeapState, HeapStats},
  runtime,
  segment::Segment,
  size_class::size_class,
  superblock::{SUPERBLOCK_HEADER_SIZE, Superblock},
  system,
};

/// Index of the global heap in the heap table.
pub const GLOBAL_HEAP: usize = 0;

/// Largest alignment a superblock block can satisfy.
pub const MAX_BLOCK_ALIGN: usize = SUPERBLOCK_HEADER_SIZE;

pub struct Context {
  segment: Segment,
  heaps: NonNull<Heap>,
  heap_count: usize,
  page_size: usize,
  /// Largest request served from superblocks.
  small_limit: usize,
  /// Unused bytes a processor heap may hold before releasing superblocks.
  release_slack: usize,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
  /// Maps the segment, carves the heap table out of it and initializes every
  /// heap. The table is sized `1 + processors * heaps_per_processor` and never
  /// changes afterwards.
  pub fn new(config: Config) -> Result<Self, InitError> {
    config.validate()?;
    let processors = config.processors.unwrap_or_else(runtime::processor_count);
    let heap_count = processors
      .checked_mul(config.heaps_per_processor)
      .and_then(|n| n.checked_add(1))
      .filter(|&n| n <= u32::MAX as usize)
      .ok_or(InitError::Config("heap table too large"))?;

    let mut segment = Segment::new(config.segment_bytes);
    if !segment.is_initialized() {
      segment.init()?;
    }
    let page_size = segment.page_size();
    if page_size < 2 * SUPERBLOCK_HEADER_SIZE {
      return Err(InitError::Config("page size too small for superblocks"));
    }

    let table_bytes = align_up(heap_count * size_of::<Heap>(), page_size);
    let heaps = segment
      .extend(table_bytes)
      .ok_or(InitError::HeapTable { bytes: table_bytes })?
      .cast::<Heap>();
    for index in 0..heap_count {
      unsafe { heaps.as_ptr().add(index).write(Heap::new(index as u32)) };
    }

    debug!(
      "allocator context: {processors} processors, {heap_count} heaps, page {page_size}, segment {} bytes",
      config.segment_bytes
    );

    Ok(Self {
      segment,
      heaps,
      heap_count,
      page_size,
      small_limit: page_size / 2,
      release_slack: config.release_slack * (page_size - SUPERBLOCK_HEADER_SIZE),
    })
  }

  #[inline]
  fn heaps(&self) -> &[Heap] {
    unsafe { slice::from_raw_parts(self.heaps.as_ptr(), self.heap_count) }
  }

  /// Global heap plus processor heaps.
  #[inline]
  pub fn heap_count(&self) -> usize {
    self.heap_count
  }

  #[inline]
  pub fn processor_heaps(&self) -> usize {
    self.heap_count - 1
  }

  #[inline]
  pub fn global_heap_index(&self) -> usize {
    GLOBAL_HEAP
  }

  /// Processor heap for a thread ordinal. Never the global heap.
  #[inline]
  pub fn heap_for_thread(&self, ordinal: u32) -> usize {
    1 + ordinal as usize % self.processor_heaps()
  }

  #[inline]
  pub fn heap_for_current_thread(&self) -> usize {
    self.heap_for_thread(runtime::thread_ordinal())
  }

  /// Superblock size: one page.
  #[inline]
  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Requests above this go to the system allocator.
  #[inline]
  pub fn small_limit(&self) -> usize {
    self.small_limit
  }

  pub fn segment(&self) -> &Segment {
    &self.segment
  }

  /// Whether `ptr` points into memory carved from this context's segment.
  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    self.segment.contains(ptr)
  }

  pub fn heap_stats(&self, index: usize) -> Option<HeapStats> {
    self.heaps().get(index).map(|heap| heap.lock().stats())
  }

  /// Checks every heap's bins and accounting.
  pub fn verify(&self) -> Result<(), HeapViolation> {
    self.heaps().iter().try_for_each(|heap| heap.lock().verify())
  }

  /// Locks heaps `a` and `b`, lower index first, and returns the guards in
  /// argument order.
  pub(crate) fn lock_pair(&self, a: usize, b: usize) -> (HeapGuard<'_>, HeapGuard<'_>) {
    debug_assert_ne!(a, b, "lock_pair needs two distinct heaps");
    let heaps = self.heaps();
    if a < b {
      let first = heaps[a].lock();
      (first, heaps[b].lock())
    } else {
      let first = heaps[b].lock();
      (heaps[a].lock(), first)
    }
  }

  /// Locks the heap that currently owns `sb`. The owner can change until its
  /// lock is held, so re-check after locking.
  fn lock_owner(&self, sb: Superblock) -> (usize, HeapGuard<'_>) {
    loop {
      let owner = sb.owner() as usize;
      debug_assert!(owner < self.heap_count);
      let state = self.heaps()[owner].lock();
      if sb.owner() as usize == owner {
        return (owner, state);
      }
    }
  }

  /// Allocates `size` bytes from the calling thread's heap, or from the system
  /// allocator when `size > small_limit()`.
  #[inline]
  pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
    self.allocate_aligned(size, 1)
  }

  /// Like [`Context::allocate`] with an alignment. Alignments up to
  /// [`MAX_BLOCK_ALIGN`] are served by rounding the size up to the alignment:
  /// every block is aligned to `min(block_size, MAX_BLOCK_ALIGN)`.
  pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);
    let padded = size.max(align);
    if align > MAX_BLOCK_ALIGN || padded > self.small_limit {
      return system::alloc_aligned(size, align);
    }
    self.allocate_small(self.heap_for_current_thread(), size_class(padded))
  }

  fn allocate_small(&self, heap: usize, class: u32) -> Option<NonNull<u8>> {
    debug_assert_ne!(heap, GLOBAL_HEAP);

    // 1) Own heap
    {
      let mut state = self.heaps()[heap].lock();
      if let Some(sb) = state.find(class) {
        return state.allocate(sb).and_then(NonNull::new);
      }
    }

    let (mut global, mut state) = self.lock_pair(GLOBAL_HEAP, heap);

    // Refilled by a remote free while unlocked?
    if let Some(sb) = state.find(class) {
      return state.allocate(sb).and_then(NonNull::new);
    }

    // 2) Global heap
    if let Some(sb) = self.borrow(&mut global, &mut state, class) {
      drop(global);
      let ptr = state.allocate(sb);
      drop(state);
      trace!("heap {heap}: borrowed superblock {:p} for class {class}", sb.as_ptr());
      return ptr.and_then(NonNull::new);
    }
    drop(global);

    // 3) Fresh superblock from the segment
    let Some(base) = self.segment.extend(self.page_size) else {
      drop(state);
      warn!("heap {heap}: segment exhausted, class {class} allocation failed");
      return None;
    };
    let sb = unsafe { Superblock::init(base, self.page_size, heap as u32, class) };
    state.adopt(sb);
    let ptr = state.allocate(sb);
    drop(state);
    trace!("heap {heap}: carved superblock {:p} for class {class}", sb.as_ptr());
    ptr.and_then(NonNull::new)
  }

  /// Moves a superblock usable for `class` from the global heap into `heap`.
  /// Prefers one already of `class`; otherwise recycles an empty superblock
  /// of any class.
  fn borrow(&self, global: &mut HeapState, heap: &mut HeapState, class: u32) -> Option<Superblock> {
    if global.is_full() {
      return None;
    }
    let sb = match global.find(class) {
      Some(sb) => {
        global.release(sb);
        sb
      }
      None => {
        let sb = global.find_empty()?;
        global.release(sb);
        sb.reinit(self.page_size, class);
        sb
      }
    };
    heap.adopt(sb);
    Some(sb)
  }

  /// Frees a block from [`Context::allocate`]. Pointers outside the segment
  /// came from the system allocator and are returned there.
  ///
  /// # Safety
  /// `ptr` must come from this context's `allocate` and not have been freed.
  pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
    if !self.segment.contains(ptr.as_ptr()) {
      unsafe { system::free(ptr) };
      return;
    }
    let sb = unsafe { Superblock::containing(ptr.as_ptr(), self.page_size) };

    #[cfg(feature = "debug-tripwire")]
    if !sb.has_magic() || sb.owner() as usize >= self.heap_count {
      log::error!("free({:p}): not inside a superblock, ignored", ptr.as_ptr());
      return;
    }

    let (heap, mut state) = self.lock_owner(sb);

    #[cfg(feature = "debug-tripwire")]
    if !sb.is_live_block(ptr.as_ptr()) {
      drop(state);
      log::error!("free({:p}): not a live block (double free?), ignored", ptr.as_ptr());
      return;
    }

    state.free(sb, ptr.as_ptr());
    if heap == GLOBAL_HEAP || !state.needs_release(self.release_slack) {
      return;
    }
    drop(state);
    self.release_to_global(heap);
  }

  /// Emptiness policy: moves the emptiest superblocks of `heap` to the global
  /// heap until the heap satisfies the blowup invariant again.
  fn release_to_global(&self, heap: usize) {
    let (mut global, mut state) = self.lock_pair(GLOBAL_HEAP, heap);
    let mut moved = 0usize;
    while state.needs_release(self.release_slack) {
      let Some(sb) = state.emptiest() else {
        break;
      };
      state.release(sb);
      global.adopt(sb);
      moved += 1;
    }
    drop(state);
    drop(global);
    if moved > 0 {
      trace!("heap {heap}: released {moved} superblock(s) to the global heap");
    }
  }

  /// Usable bytes at `ptr`: the block size for superblock blocks.
  ///
  /// # Safety
  /// `ptr` must be live and come from this context.
  pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    if self.segment.contains(ptr.as_ptr()) {
      // Block size only changes while a superblock has no live blocks.
      unsafe { Superblock::containing(ptr.as_ptr(), self.page_size) }.block_size()
    } else {
      unsafe { system::usable_size(ptr) }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{sync::Arc, thread};

  fn context(processors: usize) -> Context {
    Context::new(Config::new().processors(processors).segment_bytes(16 << 20)).unwrap()
  }

  #[test]
  fn heap_table_is_sized_from_processors() {
    let ctx = context(3);
    assert_eq!(ctx.heap_count(), 1 + 3 * crate::HEAP_CPU_FACTOR);
    assert_eq!(ctx.global_heap_index(), 0);
    for ordinal in 0..100 {
      let heap = ctx.heap_for_thread(ordinal);
      assert!((1..ctx.heap_count()).contains(&heap));
    }
    assert_eq!(ctx.heap_for_thread(0), ctx.heap_for_thread(ctx.processor_heaps() as u32));
  }

  #[test]
  fn heap_table_larger_than_segment_fails() {
    let page = crate::segment::os_page_size();
    let err = Context::new(Config::new().processors(64).segment_bytes(1)).err();
    let heaps = 1 + 64 * crate::HEAP_CPU_FACTOR;
    let bytes = align_up(heaps * size_of::<Heap>(), page);
    assert_eq!(err, Some(InitError::HeapTable { bytes }));
  }

  #[test]
  fn unmappable_segment_fails_to_reserve() {
    let err = Context::new(Config::new().processors(1).segment_bytes(usize::MAX / 2)).err();
    assert!(matches!(err, Some(InitError::Reserve { .. })), "{err:?}");
  }

  #[test]
  fn table_lives_in_the_segment() {
    let ctx = context(1);
    assert!(ctx.segment().used() >= ctx.page_size());
    assert_eq!(ctx.segment().used() % ctx.page_size(), 0);
  }

  #[test]
  fn lock_pair_returns_guards_in_argument_order() {
    let ctx = context(2);
    let (a, b) = ctx.lock_pair(3, 1);
    assert_eq!((a.index(), b.index()), (3, 1));
    drop((a, b));
    let (a, b) = ctx.lock_pair(0, 4);
    assert_eq!((a.index(), b.index()), (0, 4));
  }

  #[test]
  #[cfg(debug_assertions)]
  #[should_panic]
  fn lock_pair_rejects_same_heap() {
    let ctx = context(1);
    let _ = ctx.lock_pair(1, 1);
  }

  #[test]
  fn opposite_lock_pair_orders_do_not_deadlock() {
    let ctx = Arc::new(context(2));
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let ctx = Arc::clone(&ctx);
        thread::spawn(move || {
          for i in 0..2_000usize {
            let (a, b) = if (t + i) % 2 == 0 { (1, 2) } else { (2, 1) };
            let (mut x, mut y) = ctx.lock_pair(a, b);
            x.mem_used += 1;
            y.mem_used += 1;
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    let (one, two) = ctx.lock_pair(1, 2);
    assert_eq!(one.mem_used, 16_000);
    assert_eq!(two.mem_used, 16_000);
  }

  #[test]
  fn carve_then_reuse_own_superblock() {
    let ctx = context(1);
    let heap = ctx.heap_for_current_thread();
    let a = ctx.allocate(24).unwrap();
    let b = ctx.allocate(30).unwrap();
    let stats = ctx.heap_stats(heap).unwrap();
    assert_eq!(stats.superblocks, 1);
    assert_eq!(stats.mem_used, 64);
    assert_eq!(unsafe { ctx.usable_size(a) }, 32);
    unsafe {
      ctx.deallocate(a);
      ctx.deallocate(b);
    }
    assert_eq!(ctx.heap_stats(heap).unwrap().mem_used, 0);
    ctx.verify().unwrap();
  }

  #[test]
  fn alignment_up_to_block_alignment() {
    let ctx = context(1);
    for align in [1, 2, 8, 16, 32, 64] {
      let ptr = ctx.allocate_aligned(3, align).unwrap();
      assert_eq!(ptr.as_ptr() as usize % align, 0);
      assert!(ctx.contains(ptr.as_ptr()));
      unsafe { ctx.deallocate(ptr) };
    }
    let ptr = ctx.allocate_aligned(3, 256).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 256, 0);
    assert!(!ctx.contains(ptr.as_ptr()));
    unsafe { ctx.deallocate(ptr) };
  }

  #[test]
  fn empty_global_superblock_is_recycled_for_another_class() {
    let ctx = Context::new(
      Config::new()
        .processors(1)
        .release_slack(0)
        .segment_bytes(16 << 20),
    )
    .unwrap();
    let heap = ctx.heap_for_current_thread();

    let ptr = ctx.allocate(8).unwrap();
    unsafe { ctx.deallocate(ptr) };
    // With no slack the now empty superblock goes straight to the global heap.
    assert_eq!(ctx.heap_stats(heap).unwrap().superblocks, 0);
    assert_eq!(ctx.heap_stats(GLOBAL_HEAP).unwrap().superblocks, 1);
    let carved = ctx.segment().used();

    let ptr = ctx.allocate(200).unwrap();
    assert_eq!(ctx.segment().used(), carved, "no new page carved");
    assert_eq!(ctx.heap_stats(GLOBAL_HEAP).unwrap().superblocks, 0);
    assert_eq!(unsafe { ctx.usable_size(ptr) }, 256);
    unsafe { ctx.deallocate(ptr) };
    ctx.verify().unwrap();
  }

  #[test]
  fn exhausted_segment_returns_none() {
    let page = crate::segment::os_page_size();
    let ctx = Context::new(Config::new().processors(1).segment_bytes(3 * page)).unwrap();
    let block = ctx.small_limit();
    let per_superblock = (page - SUPERBLOCK_HEADER_SIZE) / block;
    let mut live = Vec::new();
    while let Some(ptr) = ctx.allocate(block) {
      live.push(ptr);
      assert!(live.len() <= 2 * per_superblock);
    }
    assert_eq!(live.len(), 2 * per_superblock);
    for ptr in live {
      unsafe { ctx.deallocate(ptr) };
    }
    ctx.verify().unwrap();
  }

  #[cfg(feature = "debug-tripwire")]
  #[test]
  fn tripwire_ignores_double_free() {
    let ctx = context(1);
    let heap = ctx.heap_for_current_thread();
    let a = ctx.allocate(40).unwrap();
    let b = ctx.allocate(40).unwrap();

    unsafe {
      ctx.deallocate(a);
      ctx.deallocate(a);
    }
    assert_eq!(ctx.heap_stats(heap).unwrap().mem_used, 64);
    ctx.verify().unwrap();

    let c = ctx.allocate(40).unwrap();
    let d = ctx.allocate(40).unwrap();
    assert_eq!(c, a);
    assert_ne!(d, c);
    assert_ne!(d, b);
    ctx.verify().unwrap();
    for ptr in [b, c, d] {
      unsafe { ctx.deallocate(ptr) };
    }
    assert_eq!(ctx.heap_stats(heap).unwrap().mem_used, 0);
  }

  #[cfg(feature = "debug-tripwire")]
  #[test]
  fn tripwire_ignores_pointers_that_are_not_blocks() {
    let ctx = context(1);
    let heap = ctx.heap_for_current_thread();
    let a = ctx.allocate(40).unwrap();
    let before = ctx.heap_stats(heap).unwrap();

    unsafe {
      // Interior of a live block.
      ctx.deallocate(NonNull::new(a.as_ptr().add(1)).unwrap());
      // Heap table page: in the segment, but not a superblock.
      ctx.deallocate(NonNull::new(ctx.segment().lo().add(8)).unwrap());
    }
    assert_eq!(ctx.heap_stats(heap).unwrap(), before);
    ctx.verify().unwrap();
    unsafe { ctx.deallocate(a) };
  }
}
