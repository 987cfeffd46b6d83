//! Allocator tuning.

use serde::{Deserialize, Serialize};

use crate::{
  block::{ALIGNMENT, OVERHEAD},
  error::{AllocError, Result},
  free_list::SizeClasses,
};

/// Size-class thresholds on total block size, in bytes.
pub const DEFAULT_CLASS_THRESHOLDS: [usize; 3] = [290, 540, 2080];

/// Smallest payload a split-off remainder must be able to hold.
pub const DEFAULT_MIN_SPLIT_PAYLOAD: usize = 40;

/// Tuning constants for a [`BlockAllocator`](crate::BlockAllocator).
///
/// None of these values change what the allocator guarantees, only how it
/// trades speed for fragmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
  /// Strictly ascending upper bounds of every class but the last.
  pub class_thresholds: Vec<usize>,
  /// A free block is split only when the leftover exceeds the boundary-tag
  /// overhead plus this many bytes.
  pub min_split_payload: usize,
  /// Run the heap checker after every mutating operation and panic on
  /// corruption.
  pub check_after_ops: bool,
}

impl Default for AllocatorConfig {
  fn default() -> Self {
    Self {
      class_thresholds: DEFAULT_CLASS_THRESHOLDS.to_vec(),
      min_split_payload: DEFAULT_MIN_SPLIT_PAYLOAD,
      check_after_ops: cfg!(debug_assertions),
    }
  }
}

impl AllocatorConfig {
  /// Parses a JSON document; missing fields take their defaults.
  pub fn from_json(text: &str) -> Result<Self> {
    let config: Self = serde_json::from_str(text)?;
    config.validate()?;
    Ok(config)
  }

  pub fn with_class_thresholds(
    mut self,
    thresholds: Vec<usize>,
  ) -> Self {
    self.class_thresholds = thresholds;
    self
  }

  pub fn with_min_split_payload(
    mut self,
    bytes: usize,
  ) -> Self {
    self.min_split_payload = bytes;
    self
  }

  pub fn with_check_after_ops(
    mut self,
    enabled: bool,
  ) -> Self {
    self.check_after_ops = enabled;
    self
  }

  /// Smallest difference between a free block and a request that makes the
  /// allocator split the block.
  pub fn split_threshold(&self) -> usize {
    OVERHEAD + self.min_split_payload
  }

  pub fn size_classes(&self) -> SizeClasses {
    SizeClasses::new(self.class_thresholds.clone())
  }

  pub fn validate(&self) -> Result<()> {
    if self.class_thresholds.contains(&0) {
      return Err(AllocError::InvalidConfig(
        "size-class thresholds must be positive".to_string(),
      ));
    }
    if !self.class_thresholds.windows(2).all(|pair| pair[0] < pair[1]) {
      return Err(AllocError::InvalidConfig(format!(
        "size-class thresholds must be strictly ascending, got {:?}",
        self.class_thresholds
      )));
    }
    // A remainder has to hold its own list links.
    if self.min_split_payload < 2 * ALIGNMENT || self.min_split_payload % ALIGNMENT != 0 {
      return Err(AllocError::InvalidConfig(format!(
        "minimum split payload must be a multiple of {ALIGNMENT} and at least {}, got {}",
        2 * ALIGNMENT,
        self.min_split_payload
      )));
    }
    Ok(())
  }
}
