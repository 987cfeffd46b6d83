//! Boundary-tag layout shared by every block in the arena.
//!
//! ```text
//!   Allocated block                      Free block
//!   ┌──────────────────────┐             ┌──────────────────────┐
//!   │ header: size | A | P │             │ header: size | 0 | P │
//!   ├──────────────────────┤ ◀─ payload  ├──────────────────────┤
//!   │                      │             │ next   (list link)   │
//!   │       payload        │             │ prior  (list link)   │
//!   │                      │             │         ...          │
//!   │                      │             ├──────────────────────┤
//!   │                      │             │ footer: size | 0 | P │
//!   └──────────────────────┘             └──────────────────────┘
//!
//!   A = this block is allocated, P = the previous block is allocated
//! ```
//!
//! Every word is 8 bytes, little-endian. Offsets are relative to the start of
//! the arena.

use std::{fmt, num::NonZeroUsize};

use crate::align;

pub const WORD: usize = 8;
pub const ALIGNMENT: usize = 8;

pub const HEADER_SIZE: usize = WORD;
pub const FOOTER_SIZE: usize = WORD;
/// Header plus footer.
pub const OVERHEAD: usize = HEADER_SIZE + FOOTER_SIZE;
/// Header, two list links and a footer: the smallest block that can be freed.
pub const MIN_BLOCK_SIZE: usize = HEADER_SIZE + 2 * WORD + FOOTER_SIZE;
/// A free-list head: a tag word followed by the two links.
pub const SENTINEL_SIZE: usize = HEADER_SIZE + 2 * WORD;
/// The epilogue is a lone header.
pub const EPILOGUE_SIZE: usize = HEADER_SIZE;

/// Handle to an allocation: the arena offset of its payload.
///
/// Offset zero is always inside the prologue, so it never names a payload and
/// `Option<BlockPtr>` stays one word wide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockPtr(NonZeroUsize);

impl BlockPtr {
  pub fn new(offset: usize) -> Option<Self> {
    NonZeroUsize::new(offset).map(Self)
  }

  pub(crate) const fn from_nonzero(offset: NonZeroUsize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0.get()
  }
}

impl fmt::Display for BlockPtr {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "{:#x}", self.offset())
  }
}

const ALLOCATED: u64 = 0b01;
const PREV_ALLOCATED: u64 = 0b10;
const FLAG_MASK: u64 = (ALIGNMENT as u64) - 1;

/// Decoded size/flag word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag {
  pub size: usize,
  pub allocated: bool,
  pub prev_allocated: bool,
}

impl Tag {
  pub const fn free(
    size: usize,
    prev_allocated: bool,
  ) -> Self {
    Self {
      size,
      allocated: false,
      prev_allocated,
    }
  }

  pub const fn allocated(
    size: usize,
    prev_allocated: bool,
  ) -> Self {
    Self {
      size,
      allocated: true,
      prev_allocated,
    }
  }

  pub const fn pack(self) -> u64 {
    let mut raw = (self.size as u64) & !FLAG_MASK;
    if self.allocated {
      raw |= ALLOCATED;
    }
    if self.prev_allocated {
      raw |= PREV_ALLOCATED;
    }
    raw
  }

  pub const fn unpack(raw: u64) -> Self {
    Self {
      size: (raw & !FLAG_MASK) as usize,
      allocated: raw & ALLOCATED != 0,
      prev_allocated: raw & PREV_ALLOCATED != 0,
    }
  }
}

/// Block size needed to serve a request of `request` payload bytes, or
/// `None` if the rounded size does not fit in a word.
pub fn needed_size(request: usize) -> Option<usize> {
  request.checked_add(OVERHEAD + ALIGNMENT - 1)?;
  Some(align!(request + OVERHEAD).max(MIN_BLOCK_SIZE))
}

pub(crate) fn read_word(
  bytes: &[u8],
  offset: usize,
) -> u64 {
  let mut word = [0u8; WORD];
  word.copy_from_slice(&bytes[offset..offset + WORD]);
  u64::from_le_bytes(word)
}

/// Non-panicking read for code that must survive a corrupted arena.
pub(crate) fn try_read_word(
  bytes: &[u8],
  offset: usize,
) -> Option<u64> {
  let end = offset.checked_add(WORD)?;
  let slice = bytes.get(offset..end)?;
  let mut word = [0u8; WORD];
  word.copy_from_slice(slice);
  Some(u64::from_le_bytes(word))
}

pub(crate) fn write_word(
  bytes: &mut [u8],
  offset: usize,
  value: u64,
) {
  bytes[offset..offset + WORD].copy_from_slice(&value.to_le_bytes());
}

/// A block, named by the arena offset of its header.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

impl Block {
  pub const fn at(offset: usize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0
  }

  pub const fn from_payload(ptr: BlockPtr) -> Self {
    Self(ptr.offset() - HEADER_SIZE)
  }

  pub const fn payload(self) -> BlockPtr {
    // offset + HEADER_SIZE is at least one word, so never zero.
    BlockPtr::from_nonzero(NonZeroUsize::MIN.saturating_add(self.0 + HEADER_SIZE - 1))
  }

  pub fn tag(
    self,
    bytes: &[u8],
  ) -> Tag {
    Tag::unpack(read_word(bytes, self.0))
  }

  pub fn size(
    self,
    bytes: &[u8],
  ) -> usize {
    self.tag(bytes).size
  }

  pub fn is_free(
    self,
    bytes: &[u8],
  ) -> bool {
    !self.tag(bytes).allocated
  }

  pub fn prev_allocated(
    self,
    bytes: &[u8],
  ) -> bool {
    self.tag(bytes).prev_allocated
  }

  /// Offset of the footer word. Only meaningful while the block is free.
  pub fn footer(
    self,
    bytes: &[u8],
  ) -> usize {
    self.0 + self.size(bytes) - FOOTER_SIZE
  }

  pub fn footer_tag(
    self,
    bytes: &[u8],
  ) -> Tag {
    Tag::unpack(read_word(bytes, self.footer(bytes)))
  }

  pub fn next(
    self,
    bytes: &[u8],
  ) -> Block {
    Block(self.0 + self.size(bytes))
  }

  /// The block before this one, found through its footer. Only valid when
  /// `prev_allocated` is false.
  pub fn prev(
    self,
    bytes: &[u8],
  ) -> Block {
    let footer = Tag::unpack(read_word(bytes, self.0 - FOOTER_SIZE));
    Block(self.0 - footer.size)
  }

  pub fn set_header(
    self,
    bytes: &mut [u8],
    tag: Tag,
  ) {
    write_word(bytes, self.0, tag.pack());
  }

  /// Writes `tag` into the footer slot of a block of `tag.size` bytes.
  pub fn set_footer(
    self,
    bytes: &mut [u8],
    tag: Tag,
  ) {
    write_word(bytes, self.0 + tag.size - FOOTER_SIZE, tag.pack());
  }

  /// Header and footer of a free block in one go.
  pub fn format_free(
    self,
    bytes: &mut [u8],
    size: usize,
    prev_allocated: bool,
  ) {
    let tag = Tag::free(size, prev_allocated);
    self.set_header(bytes, tag);
    self.set_footer(bytes, tag);
  }

  pub fn set_prev_allocated(
    self,
    bytes: &mut [u8],
    prev_allocated: bool,
  ) {
    let tag = self.tag(bytes);
    self.set_header(bytes, Tag { prev_allocated, ..tag });
    // Free blocks keep their footer in sync with the header.
    if !tag.allocated && tag.size >= MIN_BLOCK_SIZE {
      self.set_footer(bytes, Tag { prev_allocated, ..tag });
    }
  }

  pub fn next_link(
    self,
    bytes: &[u8],
  ) -> Block {
    Block(read_word(bytes, self.0 + HEADER_SIZE) as usize)
  }

  pub fn prior_link(
    self,
    bytes: &[u8],
  ) -> Block {
    Block(read_word(bytes, self.0 + HEADER_SIZE + WORD) as usize)
  }

  pub fn set_next_link(
    self,
    bytes: &mut [u8],
    next: Block,
  ) {
    write_word(bytes, self.0 + HEADER_SIZE, next.0 as u64);
  }

  pub fn set_prior_link(
    self,
    bytes: &mut [u8],
    prior: Block,
  ) {
    write_word(bytes, self.0 + HEADER_SIZE + WORD, prior.0 as u64);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tag_packs_flags_into_low_bits() {
    let tag = Tag::allocated(48, true);
    assert_eq!(tag.pack(), 48 | 0b11);
    assert_eq!(Tag::unpack(tag.pack()), tag);

    let tag = Tag::free(4096, false);
    assert_eq!(tag.pack(), 4096);
    assert_eq!(Tag::unpack(4096 | 0b10), Tag::free(4096, true));
  }

  #[test]
  fn needed_size_adds_overhead_and_rounds() {
    assert_eq!(needed_size(1), Some(MIN_BLOCK_SIZE));
    assert_eq!(needed_size(16), Some(32));
    assert_eq!(needed_size(17), Some(40));
    assert_eq!(needed_size(100), Some(120));
    assert_eq!(needed_size(usize::MAX), None);
    assert_eq!(needed_size(usize::MAX - OVERHEAD), None);
  }

  #[test]
  fn neighbours_are_found_through_tags() {
    let mut bytes = vec![0u8; 256];
    let first = Block::at(8);
    let second = Block::at(8 + 64);

    first.format_free(&mut bytes, 64, true);
    second.set_header(&mut bytes, Tag::allocated(48, false));

    assert_eq!(first.next(&bytes), second);
    assert_eq!(second.prev(&bytes), first);
    assert_eq!(first.footer(&bytes), 8 + 64 - FOOTER_SIZE);
    assert_eq!(first.footer_tag(&bytes), first.tag(&bytes));
    assert!(first.is_free(&bytes));
    assert!(!second.is_free(&bytes));
    assert!(!second.prev_allocated(&bytes));
  }

  #[test]
  fn prev_allocated_update_keeps_footer_in_sync() {
    let mut bytes = vec![0u8; 128];
    let block = Block::at(16);
    block.format_free(&mut bytes, 32, false);

    block.set_prev_allocated(&mut bytes, true);

    assert!(block.prev_allocated(&bytes));
    assert_eq!(block.footer_tag(&bytes), Tag::free(32, true));
  }

  #[test]
  fn payload_round_trips_through_header() {
    let block = Block::at(96);
    assert_eq!(block.payload().offset(), 104);
    assert_eq!(Block::from_payload(block.payload()), block);
  }

  #[test]
  fn try_read_word_refuses_out_of_bounds() {
    let bytes = vec![0u8; 16];
    assert_eq!(try_read_word(&bytes, 8), Some(0));
    assert_eq!(try_read_word(&bytes, 9), None);
    assert_eq!(try_read_word(&bytes, usize::MAX), None);
  }
}
