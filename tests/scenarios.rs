use hoardalloc::{Config, Context, HeapStats, class_size, size_class};

fn context() -> Context {
  Context::new(Config::new().processors(2).segment_bytes(32 << 20)).unwrap()
}

fn all_stats(ctx: &Context) -> Vec<HeapStats> {
  (0..ctx.heap_count())
    .map(|i| ctx.heap_stats(i).unwrap())
    .collect()
}

#[test]
fn five_bytes_get_an_eight_byte_block() {
  assert_eq!(size_class(5), 3);
  assert_eq!(class_size(3), 8);

  let ctx = context();
  let ptr = ctx.allocate(5).unwrap();
  assert_eq!(unsafe { ctx.usable_size(ptr) }, 8);
  unsafe { ctx.deallocate(ptr) };
}

#[test]
fn one_byte_gets_the_minimum_block() {
  assert_eq!(size_class(1), 2);
  assert_eq!(class_size(2), 4);

  let ctx = context();
  let ptr = ctx.allocate(1).unwrap();
  assert_eq!(unsafe { ctx.usable_size(ptr) }, 4);
  unsafe { ctx.deallocate(ptr) };
}

#[test]
fn freed_block_is_reused_first() {
  let ctx = context();
  let a = ctx.allocate(16).unwrap();
  let b = ctx.allocate(16).unwrap();
  assert_ne!(a, b);
  unsafe { b.as_ptr().write_bytes(0xB7, 16) };

  unsafe { ctx.deallocate(a) };
  let c = ctx.allocate(16).unwrap();
  assert_eq!(c, a);
  assert!((0..16).all(|i| unsafe { *b.as_ptr().add(i) } == 0xB7));

  unsafe {
    ctx.deallocate(b);
    ctx.deallocate(c);
  }
  ctx.verify().unwrap();
}

#[test]
fn large_request_bypasses_every_heap() {
  let ctx = context();
  // Warm the calling thread's heap so there is state to disturb.
  let warm = ctx.allocate(64).unwrap();
  let before = all_stats(&ctx);
  let used = ctx.segment().used();

  let ptr = ctx.allocate(ctx.small_limit() + 1).unwrap();
  assert!(!ctx.contains(ptr.as_ptr()));
  assert_eq!(all_stats(&ctx), before);
  assert_eq!(ctx.segment().used(), used);

  unsafe { ctx.deallocate(ptr) };
  assert_eq!(all_stats(&ctx), before);
  unsafe { ctx.deallocate(warm) };
}

#[test]
fn small_limit_is_half_a_page() {
  let ctx = context();
  assert_eq!(ctx.small_limit(), ctx.page_size() / 2);

  let ptr = ctx.allocate(ctx.small_limit()).unwrap();
  assert!(ctx.contains(ptr.as_ptr()));
  assert_eq!(unsafe { ctx.usable_size(ptr) }, ctx.small_limit());
  unsafe { ctx.deallocate(ptr) };
}

#[test]
fn zero_size_requests_get_a_block() {
  let ctx = context();
  let ptr = ctx.allocate(0).unwrap();
  assert_eq!(
    unsafe { ctx.usable_size(ptr) },
    class_size(hoardalloc::SIZE_CLASS_MIN)
  );
  unsafe { ctx.deallocate(ptr) };
}

#[test]
fn patterns_survive_until_freed() {
  let ctx = context();
  let sizes = [3usize, 8, 17, 60, 100, 255, 511, 1000, 2047];
  let blocks: Vec<_> = sizes
    .iter()
    .enumerate()
    .map(|(i, &size)| {
      let ptr = ctx.allocate(size).unwrap();
      unsafe { ptr.as_ptr().write_bytes(i as u8 + 1, size) };
      (ptr, size, i as u8 + 1)
    })
    .collect();

  for &(ptr, size, byte) in &blocks {
    assert!(unsafe { ctx.usable_size(ptr) } >= size);
    assert!((0..size).all(|i| unsafe { *ptr.as_ptr().add(i) } == byte));
  }
  for (ptr, _, _) in blocks {
    unsafe { ctx.deallocate(ptr) };
  }
  ctx.verify().unwrap();
}

#[test]
fn heap_accounting_tracks_live_blocks() {
  let ctx = context();
  let heap = ctx.heap_for_current_thread();
  assert_ne!(heap, ctx.global_heap_index());

  let ptrs: Vec<_> = (0..10).map(|_| ctx.allocate(100).unwrap()).collect();
  let stats = ctx.heap_stats(heap).unwrap();
  assert_eq!(stats.index, heap);
  assert_eq!(stats.mem_used, 10 * 128);
  assert_eq!(stats.superblocks, 1);
  assert!(stats.mem_allocated >= stats.mem_used);
  assert_eq!(stats.bins.iter().sum::<usize>(), 1);

  for ptr in ptrs {
    unsafe { ctx.deallocate(ptr) };
  }
  assert_eq!(ctx.heap_stats(heap).unwrap().mem_used, 0);
  assert!(ctx.heap_stats(ctx.heap_count()).is_none());
}

#[test]
fn rejects_invalid_config() {
  assert!(matches!(
    Context::new(Config::new().processors(0)),
    Err(hoardalloc::InitError::Config(_))
  ));
}
