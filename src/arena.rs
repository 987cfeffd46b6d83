//! Arena growth providers.
//!
//! The allocator never owns raw memory directly: it asks an
//! [`ArenaProvider`] for more bytes at the top of a single contiguous region,
//! the same way a C allocator calls `sbrk`.
//!
//! ```text
//!   arena_low()                               arena_high()
//!   │                                                   │
//!   ▼                                                   ▼
//!   ┌───────────────────────────────────────────────────┬─────────────┐
//!   │                 managed bytes                     │  extend(n)  │
//!   └───────────────────────────────────────────────────┴─────────────┘
//!                                                       ▲
//!                                                       └── returned base
//! ```

use crate::error::{AllocError, Result};

/// Largest arena [`VecArena::new`] will grow to (20 MiB).
pub const DEFAULT_MAX_HEAP: usize = 20 * (1 << 20);

/// Source of arena bytes.
///
/// Implementations grant bytes only at the high end, never move or shrink
/// the region, and never grant part of a request.
pub trait ArenaProvider {
  /// Grows the arena by `bytes` and returns the offset of the first new byte.
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Result<usize>;

  /// Current length of the arena in bytes.
  fn len(&self) -> usize;

  fn bytes(&self) -> &[u8];

  fn bytes_mut(&mut self) -> &mut [u8];

  fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Lowest managed offset.
  fn arena_low(&self) -> usize {
    0
  }

  /// Highest managed offset, inclusive.
  fn arena_high(&self) -> usize {
    self.len().saturating_sub(1)
  }
}

/// A heap-backed arena with a hard size limit.
///
/// Storage is a vector of words, so every 8-aligned offset is also an
/// 8-aligned address.
#[derive(Debug)]
pub struct VecArena {
  words: Vec<u64>,
  brk: usize,
  limit: usize,
}

impl VecArena {
  pub fn new() -> Self {
    Self::with_limit(DEFAULT_MAX_HEAP)
  }

  /// An arena that refuses to grow past `limit` bytes.
  pub fn with_limit(limit: usize) -> Self {
    Self {
      words: Vec::new(),
      brk: 0,
      limit,
    }
  }

  pub fn limit(&self) -> usize {
    self.limit
  }
}

impl Default for VecArena {
  fn default() -> Self {
    Self::new()
  }
}

impl ArenaProvider for VecArena {
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Result<usize> {
    let base = self.brk;
    let new_brk = match base.checked_add(bytes) {
      Some(new_brk) if new_brk <= self.limit => new_brk,
      _ => {
        log::warn!("VecArena::extend({bytes:#x}) refused at {base:#x} of {:#x}", self.limit);
        return Err(AllocError::OutOfMemory {
          requested: bytes,
          used: base,
          limit: self.limit,
        });
      }
    };

    let words = new_brk.div_ceil(size_of::<u64>());
    if words > self.words.len() {
      self.words.resize(words, 0);
    }
    self.brk = new_brk;

    log::debug!("VecArena::extend({bytes:#x}): break {base:#x} -> {new_brk:#x}");
    Ok(base)
  }

  fn len(&self) -> usize {
    self.brk
  }

  fn bytes(&self) -> &[u8] {
    &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.brk]
  }

  fn bytes_mut(&mut self) -> &mut [u8] {
    &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.brk]
  }
}

#[cfg(unix)]
pub use self::mmap::MmapArena;

#[cfg(unix)]
mod mmap {
  use std::{io, ptr, slice};

  use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};

  use super::ArenaProvider;
  use crate::{
    align_to,
    error::{AllocError, Result},
  };

  fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
  }

  /// An arena inside one up-front `mmap` reservation.
  ///
  /// Address space is reserved with `MAP_NORESERVE`, so untouched pages
  /// cost nothing; `extend` only moves the break within the reservation.
  pub struct MmapArena {
    base: *mut u8,
    capacity: usize,
    brk: usize,
  }

  impl MmapArena {
    /// Reserves at least `capacity` bytes (rounded up to whole pages).
    pub fn reserve(capacity: usize) -> Result<Self> {
      let page = page_size();
      let size = match capacity.checked_add(page - 1) {
        Some(_) if capacity > 0 => align_to!(capacity, page),
        _ => {
          return Err(AllocError::InvalidConfig(format!(
            "cannot reserve an arena of {capacity} bytes"
          )));
        }
      };

      // SAFETY: an anonymous private mapping at a kernel-chosen address
      // does not alias any existing Rust object.
      let base = unsafe {
        libc::mmap(
          ptr::null_mut(),
          size,
          PROT_READ | PROT_WRITE,
          MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
          -1,
          0,
        )
      };

      if base == MAP_FAILED {
        return Err(AllocError::Reserve {
          size,
          source: io::Error::last_os_error(),
        });
      }

      log::debug!("MmapArena::reserve({capacity:#x}): {size:#x} bytes at {base:p}");
      Ok(Self {
        base: base.cast(),
        capacity: size,
        brk: 0,
      })
    }

    pub fn capacity(&self) -> usize {
      self.capacity
    }
  }

  impl ArenaProvider for MmapArena {
    fn extend(
      &mut self,
      bytes: usize,
    ) -> Result<usize> {
      let base = self.brk;
      match base.checked_add(bytes) {
        Some(new_brk) if new_brk <= self.capacity => {
          self.brk = new_brk;
          log::debug!("MmapArena::extend({bytes:#x}): break {base:#x} -> {new_brk:#x}");
          Ok(base)
        }
        _ => {
          log::warn!("MmapArena::extend({bytes:#x}) refused at {base:#x} of {:#x}", self.capacity);
          Err(AllocError::OutOfMemory {
            requested: bytes,
            used: base,
            limit: self.capacity,
          })
        }
      }
    }

    fn len(&self) -> usize {
      self.brk
    }

    fn bytes(&self) -> &[u8] {
      // SAFETY: the first `brk` bytes lie inside the live mapping, which is
      // readable and zero-filled on first touch.
      unsafe { slice::from_raw_parts(self.base, self.brk) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
      // SAFETY: as in `bytes`; `&mut self` makes the view unique.
      unsafe { slice::from_raw_parts_mut(self.base, self.brk) }
    }
  }

  impl Drop for MmapArena {
    fn drop(&mut self) {
      // SAFETY: `base`/`capacity` describe exactly the mapping created in
      // `reserve`, and no view into it outlives `self`.
      unsafe {
        libc::munmap(self.base.cast(), self.capacity);
      }
    }
  }
}
