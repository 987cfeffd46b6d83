//! Segregated free lists.
//!
//! Each size class is a circular doubly-linked list threaded through the
//! payloads of its free blocks. The list heads are sentinel slots at the
//! front of the arena, so an empty class is a sentinel pointing at itself.
//!
//! ```text
//!        class 0          class 1          class 2          class 3
//!   ┌──────────────┬──────────────┬──────────────┬──────────────┐
//!   │ tag|next|prv │ tag|next|prv │ tag|next|prv │ tag|next|prv │  prologue
//!   └──────┬───────┴──────────────┴──────────────┴──────────────┘
//!          │ ▲
//!          ▼ │
//!       [free block] ⇄ [free block] ⇄ ...  (back to sentinel)
//! ```

use crate::block::{Block, SENTINEL_SIZE, Tag};

/// Ascending size thresholds splitting blocks into classes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SizeClasses {
  thresholds: Vec<usize>,
}

impl SizeClasses {
  /// `thresholds` must be strictly ascending; `AllocatorConfig::validate`
  /// enforces this before an allocator is built.
  pub fn new(thresholds: Vec<usize>) -> Self {
    debug_assert!(thresholds.windows(2).all(|pair| pair[0] < pair[1]));
    Self { thresholds }
  }

  /// Number of classes: one more than the number of thresholds.
  pub fn len(&self) -> usize {
    self.thresholds.len() + 1
  }

  pub fn is_empty(&self) -> bool {
    false
  }

  /// Class of a block of `size` bytes.
  pub fn classify(
    &self,
    size: usize,
  ) -> usize {
    self
      .thresholds
      .iter()
      .position(|&threshold| size < threshold)
      .unwrap_or(self.thresholds.len())
  }
}

/// The free list index: one sentinel-headed list per size class.
#[derive(Clone, Debug)]
pub struct FreeLists {
  classes: SizeClasses,
  base: usize,
}

impl FreeLists {
  /// An index whose sentinels start at arena offset `base`.
  pub fn new(
    classes: SizeClasses,
    base: usize,
  ) -> Self {
    Self { classes, base }
  }

  /// Bytes of prologue the sentinels occupy.
  pub fn prologue_size(&self) -> usize {
    self.classes.len() * SENTINEL_SIZE
  }

  pub fn classes(&self) -> &SizeClasses {
    &self.classes
  }

  pub fn class_count(&self) -> usize {
    self.classes.len()
  }

  pub fn classify(
    &self,
    size: usize,
  ) -> usize {
    self.classes.classify(size)
  }

  pub fn sentinel(
    &self,
    class: usize,
  ) -> Block {
    Block::at(self.base + class * SENTINEL_SIZE)
  }

  pub fn is_sentinel(
    &self,
    block: Block,
  ) -> bool {
    let offset = block.offset();
    offset >= self.base
      && offset < self.base + self.prologue_size()
      && (offset - self.base) % SENTINEL_SIZE == 0
  }

  /// Writes every sentinel as an empty list.
  pub fn init(
    &self,
    bytes: &mut [u8],
  ) {
    for class in 0..self.class_count() {
      let sentinel = self.sentinel(class);
      sentinel.set_header(bytes, Tag::allocated(0, true));
      sentinel.set_next_link(bytes, sentinel);
      sentinel.set_prior_link(bytes, sentinel);
    }
  }

  /// Pushes a free, detached block at the head of its class.
  pub fn insert(
    &self,
    bytes: &mut [u8],
    block: Block,
  ) {
    debug_assert!(block.is_free(bytes), "inserting allocated block {block:?}");
    let head = self.sentinel(self.classify(block.size(bytes)));
    let first = head.next_link(bytes);

    block.set_prior_link(bytes, head);
    block.set_next_link(bytes, first);
    first.set_prior_link(bytes, block);
    head.set_next_link(bytes, block);
  }

  /// Unlinks a block from whichever list holds it.
  pub fn remove(
    &self,
    bytes: &mut [u8],
    block: Block,
  ) {
    let next = block.next_link(bytes);
    let prior = block.prior_link(bytes);
    debug_assert!(
      prior.next_link(bytes) == block && next.prior_link(bytes) == block,
      "removing block {block:?} that is not on a free list"
    );

    prior.set_next_link(bytes, next);
    next.set_prior_link(bytes, prior);
  }

  /// First block of at least `min_size` bytes, searching the class of
  /// `min_size` and then every larger class.
  pub fn find_fit(
    &self,
    bytes: &[u8],
    min_size: usize,
  ) -> Option<Block> {
    (self.classify(min_size)..self.class_count())
      .find_map(|class| self.iter(bytes, class).find(|block| block.size(bytes) >= min_size))
  }

  /// Blocks of one class, most recently inserted first.
  pub fn iter<'a>(
    &self,
    bytes: &'a [u8],
    class: usize,
  ) -> ListIter<'a> {
    let sentinel = self.sentinel(class);
    ListIter {
      bytes,
      sentinel,
      cursor: sentinel.next_link(bytes),
    }
  }
}

pub struct ListIter<'a> {
  bytes: &'a [u8],
  sentinel: Block,
  cursor: Block,
}

impl Iterator for ListIter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    if self.cursor == self.sentinel {
      return None;
    }
    let block = self.cursor;
    self.cursor = block.next_link(self.bytes);
    Some(block)
  }
}
