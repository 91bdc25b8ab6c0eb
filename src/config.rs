//! Runtime configuration of a [`crate::Context`].

use crate::{HEAP_CPU_FACTOR, error::InitError};

/// Default segment reservation. Reserved with `MAP_NORESERVE`, so only
/// touched pages cost memory.
const SEGMENT_SIZE: usize = 1 << 30; // 1GB

/// Default unused capacity, in superblocks, a processor heap may hold before
/// the emptiness policy kicks in.
const RELEASE_SLACK: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  /// Virtual processors to size the heap table for. `None` asks the OS.
  pub processors: Option<usize>,
  /// Processor heaps per virtual processor.
  pub heaps_per_processor: usize,
  /// Bytes of address space reserved for superblocks and the heap table.
  pub segment_bytes: usize,
  /// Superblocks worth of unused capacity a processor heap keeps before
  /// returning superblocks to the global heap.
  pub release_slack: usize,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      processors: None,
      heaps_per_processor: HEAP_CPU_FACTOR,
      segment_bytes: SEGMENT_SIZE,
      release_slack: RELEASE_SLACK,
    }
  }

  pub const fn processors(mut self, processors: usize) -> Self {
    self.processors = Some(processors);
    self
  }

  pub const fn heaps_per_processor(mut self, heaps: usize) -> Self {
    self.heaps_per_processor = heaps;
    self
  }

  pub const fn segment_bytes(mut self, bytes: usize) -> Self {
    self.segment_bytes = bytes;
    self
  }

  pub const fn release_slack(mut self, superblocks: usize) -> Self {
    self.release_slack = superblocks;
    self
  }

  pub(crate) fn validate(&self) -> Result<(), InitError> {
    if self.processors == Some(0) {
      return Err(InitError::Config("processor count must be at least 1"));
    }
    if self.heaps_per_processor == 0 {
      return Err(InitError::Config("heaps_per_processor must be at least 1"));
    }
    if self.segment_bytes == 0 {
      return Err(InitError::Config("segment_bytes must be non-zero"));
    }
    Ok(())
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = Config::default();
    assert_eq!(config.processors, None);
    assert_eq!(config.heaps_per_processor, HEAP_CPU_FACTOR);
    assert!(config.validate().is_ok());
  }

  #[test]
  fn rejects_degenerate_values() {
    assert!(matches!(
      Config::new().processors(0).validate(),
      Err(InitError::Config(_))
    ));
    assert!(matches!(
      Config::new().heaps_per_processor(0).validate(),
      Err(InitError::Config(_))
    ));
    assert!(matches!(
      Config::new().segment_bytes(0).validate(),
      Err(InitError::Config(_))
    ));
  }
}
