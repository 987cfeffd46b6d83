//! Error types for the allocator.

use std::io;

use thiserror::Error;

/// Errors returned by allocator and arena operations.
#[derive(Debug, Error)]
pub enum AllocError {
  /// The arena provider refused to grow.
  #[error("arena exhausted: cannot grow by {requested} bytes ({used} of {limit} bytes in use)")]
  OutOfMemory {
    /// Bytes asked of the provider.
    requested: usize,
    /// Current arena length.
    used: usize,
    /// Largest length the provider will reach.
    limit: usize,
  },

  /// The request cannot be rounded up into a block size.
  #[error("allocation request of {0} bytes is too large")]
  RequestTooLarge(usize),

  /// The configuration was rejected by validation.
  #[error("invalid allocator configuration: {0}")]
  InvalidConfig(String),

  /// Configuration text failed to parse.
  #[error("failed to parse allocator configuration: {0}")]
  Config(#[from] serde_json::Error),

  /// The operating system refused to reserve address space.
  #[error("failed to reserve {size} bytes of address space")]
  Reserve {
    size: usize,
    #[source]
    source: io::Error,
  },
}

/// Result type for allocator operations.
pub type Result<T> = std::result::Result<T, AllocError>;
