use thiserror::Error;

/// Failure to build allocator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
  #[error("failed to reserve a {bytes} byte segment")]
  Reserve { bytes: usize },
  #[error("segment cannot supply {bytes} bytes for the heap table")]
  HeapTable { bytes: usize },
  #[error("invalid configuration: {0}")]
  Config(&'static str),
  #[error("allocator state is not available on this thread")]
  Unavailable,
}

/// Broken heap invariant, reported by [`crate::Context::verify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HeapViolation {
  #[error("heap {heap}: superblock owned by heap {owner}")]
  Owner { heap: usize, owner: usize },
  #[error("heap {heap}: superblock has {used} of {count} blocks live")]
  Overfull { heap: usize, used: usize, count: usize },
  #[error("heap {heap}: superblock in bin {actual}, occupancy says bin {expected}")]
  Bin {
    heap: usize,
    expected: usize,
    actual: usize,
  },
  #[error("heap {heap}: broken bin links")]
  Links { heap: usize },
  #[error("heap {heap}: {field} is {actual}, superblocks add up to {expected}")]
  Accounting {
    heap: usize,
    field: &'static str,
    expected: usize,
    actual: usize,
  },
}
