//! Heap consistency checking and statistics.
//!
//! The checker reads the arena with non-panicking accessors so that it can
//! describe a corrupted heap instead of crashing on it. It never writes.

use std::fmt;

use thiserror::Error;

use crate::{
  block::{ALIGNMENT, Block, EPILOGUE_SIZE, HEADER_SIZE, MIN_BLOCK_SIZE, Tag, WORD, try_read_word},
  free_list::FreeLists,
};

/// A broken heap invariant and where it was found.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("heap corruption at offset {offset:#x}: {kind}")]
pub struct HeapViolation {
  pub offset: usize,
  pub kind: ViolationKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViolationKind {
  #[error("tag read past the end of the arena")]
  Truncated,
  #[error("block on a free list is marked allocated")]
  AllocatedOnFreeList,
  #[error("free-list link {link:#x} points outside the heap")]
  LinkOutOfBounds { link: usize },
  #[error("prior link is {found:#x}, expected {expected:#x}")]
  BrokenLink { expected: usize, found: usize },
  #[error("block of {size} bytes sits in class {found}, expected class {expected}")]
  WrongSizeClass {
    size: usize,
    expected: usize,
    found: usize,
  },
  #[error("free list does not return to its sentinel")]
  FreeListCycle,
  #[error("block size {size} is misaligned or below the minimum")]
  BadBlockSize { size: usize },
  #[error("block of {size} bytes runs past the epilogue")]
  BlockOutOfBounds { size: usize },
  #[error("footer {footer:#x} disagrees with header {header:#x}")]
  FooterMismatch { header: u64, footer: u64 },
  #[error("free block follows another free block")]
  UncoalescedNeighbours,
  #[error("previous-allocated bit should be {expected}")]
  PrevAllocatedMismatch { expected: bool },
  #[error("epilogue is not a one-word allocated block")]
  BadEpilogue,
  #[error("{listed} blocks on free lists but {walked} free blocks in the heap")]
  FreeCountMismatch { listed: usize, walked: usize },
}

/// Occupancy summary of an arena.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub arena_bytes: usize,
  pub allocated_blocks: usize,
  pub allocated_bytes: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

impl fmt::Display for HeapStats {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(
      f,
      "arena {} bytes, {} allocated ({} bytes), {} free ({} bytes, largest {})",
      self.arena_bytes,
      self.allocated_blocks,
      self.allocated_bytes,
      self.free_blocks,
      self.free_bytes,
      self.largest_free
    )
  }
}

/// An entry of the free list index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
  /// Arena offset of the block header.
  pub offset: usize,
  pub size: usize,
  pub class: usize,
}

pub(crate) struct HeapChecker<'a> {
  bytes: &'a [u8],
  lists: &'a FreeLists,
  heap_start: usize,
  epilogue: usize,
}

impl<'a> HeapChecker<'a> {
  pub(crate) fn new(
    bytes: &'a [u8],
    lists: &'a FreeLists,
    heap_start: usize,
  ) -> Self {
    Self {
      bytes,
      lists,
      heap_start,
      epilogue: bytes.len().saturating_sub(EPILOGUE_SIZE),
    }
  }

  pub(crate) fn run(&self) -> Result<(), HeapViolation> {
    let listed = self.check_free_lists()?;
    let walked = self.check_blocks()?;
    if listed != walked {
      return Err(self.violation(self.heap_start, ViolationKind::FreeCountMismatch { listed, walked }));
    }
    Ok(())
  }

  fn violation(
    &self,
    offset: usize,
    kind: ViolationKind,
  ) -> HeapViolation {
    HeapViolation { offset, kind }
  }

  fn word(
    &self,
    offset: usize,
  ) -> Result<u64, HeapViolation> {
    try_read_word(self.bytes, offset).ok_or_else(|| self.violation(offset, ViolationKind::Truncated))
  }

  fn tag(
    &self,
    offset: usize,
  ) -> Result<Tag, HeapViolation> {
    self.word(offset).map(Tag::unpack)
  }

  fn in_heap(
    &self,
    offset: usize,
  ) -> bool {
    offset >= self.heap_start && offset < self.epilogue && offset % ALIGNMENT == 0
  }

  /// Walks every list and returns how many blocks they hold.
  fn check_free_lists(&self) -> Result<usize, HeapViolation> {
    let max_blocks = (self.epilogue.saturating_sub(self.heap_start)) / MIN_BLOCK_SIZE;
    let mut listed = 0;

    for class in 0..self.lists.class_count() {
      let sentinel = self.lists.sentinel(class);
      let mut prior = sentinel.offset();
      let mut cursor = self.word(sentinel.offset() + HEADER_SIZE)? as usize;
      let mut steps = 0;

      while cursor != sentinel.offset() {
        if steps > max_blocks {
          return Err(self.violation(sentinel.offset(), ViolationKind::FreeListCycle));
        }
        if !self.in_heap(cursor) {
          return Err(self.violation(prior, ViolationKind::LinkOutOfBounds { link: cursor }));
        }

        let tag = self.tag(cursor)?;
        if tag.allocated {
          return Err(self.violation(cursor, ViolationKind::AllocatedOnFreeList));
        }

        let back = self.word(cursor + HEADER_SIZE + WORD)? as usize;
        if back != prior {
          return Err(self.violation(cursor, ViolationKind::BrokenLink {
            expected: prior,
            found: back,
          }));
        }

        let expected = self.lists.classify(tag.size);
        if expected != class {
          return Err(self.violation(cursor, ViolationKind::WrongSizeClass {
            size: tag.size,
            expected,
            found: class,
          }));
        }

        listed += 1;
        steps += 1;
        prior = cursor;
        cursor = self.word(cursor + HEADER_SIZE)? as usize;
      }

      let back = self.word(sentinel.offset() + HEADER_SIZE + WORD)? as usize;
      if back != prior {
        return Err(self.violation(sentinel.offset(), ViolationKind::BrokenLink {
          expected: prior,
          found: back,
        }));
      }
    }

    Ok(listed)
  }

  /// Walks the heap by address and returns how many free blocks it holds.
  fn check_blocks(&self) -> Result<usize, HeapViolation> {
    let mut offset = self.heap_start;
    let mut prev_free = false;
    let mut walked = 0;

    while offset < self.epilogue {
      let tag = self.tag(offset)?;
      if tag.size < MIN_BLOCK_SIZE || tag.size % ALIGNMENT != 0 {
        return Err(self.violation(offset, ViolationKind::BadBlockSize { size: tag.size }));
      }
      if offset.checked_add(tag.size).is_none_or(|end| end > self.epilogue) {
        return Err(self.violation(offset, ViolationKind::BlockOutOfBounds { size: tag.size }));
      }
      if tag.prev_allocated == prev_free {
        return Err(self.violation(offset, ViolationKind::PrevAllocatedMismatch {
          expected: !prev_free,
        }));
      }

      if !tag.allocated {
        let footer = self.word(offset + tag.size - WORD)?;
        if footer != tag.pack() {
          return Err(self.violation(offset, ViolationKind::FooterMismatch {
            header: tag.pack(),
            footer,
          }));
        }
        if prev_free {
          return Err(self.violation(offset, ViolationKind::UncoalescedNeighbours));
        }
        walked += 1;
      }

      prev_free = !tag.allocated;
      offset += tag.size;
    }

    let epilogue = self.tag(self.epilogue)?;
    if offset != self.epilogue || !epilogue.allocated || epilogue.size != EPILOGUE_SIZE {
      return Err(self.violation(self.epilogue, ViolationKind::BadEpilogue));
    }
    if epilogue.prev_allocated == prev_free {
      return Err(self.violation(self.epilogue, ViolationKind::PrevAllocatedMismatch {
        expected: !prev_free,
      }));
    }

    Ok(walked)
  }

  /// Occupancy totals. Assumes a well-formed heap.
  pub(crate) fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      arena_bytes: self.bytes.len(),
      ..HeapStats::default()
    };
    let mut block = Block::at(self.heap_start);

    while block.offset() < self.epilogue {
      let tag = block.tag(self.bytes);
      if tag.size == 0 {
        break;
      }
      if tag.allocated {
        stats.allocated_blocks += 1;
        stats.allocated_bytes += tag.size;
      } else {
        stats.free_blocks += 1;
        stats.free_bytes += tag.size;
        stats.largest_free = stats.largest_free.max(tag.size);
      }
      block = block.next(self.bytes);
    }

    stats
  }

  pub(crate) fn free_blocks(&self) -> Vec<FreeBlock> {
    (0..self.lists.class_count())
      .flat_map(|class| {
        self.lists.iter(self.bytes, class).map(move |block| FreeBlock {
          offset: block.offset(),
          size: block.size(self.bytes),
          class,
        })
      })
      .collect()
  }
}
