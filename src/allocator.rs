use crate::{
  align,
  arena::{ArenaProvider, VecArena},
  block::{self, Block, BlockPtr, EPILOGUE_SIZE, HEADER_SIZE, Tag},
  check::{FreeBlock, HeapChecker, HeapStats, HeapViolation},
  config::AllocatorConfig,
  error::{AllocError, Result},
  free_list::FreeLists,
};

/// Boundary-tag allocator over a single growable arena.
///
/// Free blocks are kept in segregated, LIFO, circular lists; allocation is
/// first fit within a class and spills into larger classes. Freed blocks are
/// coalesced with free neighbours immediately, so no two adjacent blocks are
/// ever both free.
pub struct BlockAllocator<A: ArenaProvider = VecArena> {
  arena: A,
  lists: FreeLists,
  config: AllocatorConfig,
  heap_start: usize,
}

impl<A: ArenaProvider> BlockAllocator<A> {
  /// [`init`](Self::init) with the default configuration.
  pub fn new(arena: A) -> Result<Self> {
    Self::init(arena, AllocatorConfig::default())
  }

  /// Lays out the free-list sentinels and the epilogue at the top of
  /// `arena`.
  pub fn init(
    mut arena: A,
    config: AllocatorConfig,
  ) -> Result<Self> {
    config.validate()?;

    let top = arena.len();
    let base = align!(top);
    let lists = FreeLists::new(config.size_classes(), base);
    let heap_start = base + lists.prologue_size();

    arena.extend(heap_start + EPILOGUE_SIZE - top)?;

    let bytes = arena.bytes_mut();
    lists.init(bytes);
    Self::write_epilogue(bytes, Block::at(heap_start));

    log::debug!(
      "BlockAllocator::init: {} size classes, heap starts at {heap_start:#x}",
      lists.class_count()
    );

    Ok(Self {
      arena,
      lists,
      config,
      heap_start,
    })
  }

  pub fn config(&self) -> &AllocatorConfig {
    &self.config
  }

  pub fn arena(&self) -> &A {
    &self.arena
  }

  /// Allocates at least `size` payload bytes.
  ///
  /// Returns `Ok(None)` for a zero-byte request and `Err` if the arena
  /// cannot grow; a failed call leaves every existing block untouched.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<Option<BlockPtr>> {
    if size == 0 {
      log::trace!("allocate(0) -> null");
      return Ok(None);
    }

    let needed = block::needed_size(size).ok_or(AllocError::RequestTooLarge(size))?;
    let block = match self.lists.find_fit(self.arena.bytes(), needed) {
      Some(block) => {
        self.lists.remove(self.arena.bytes_mut(), block);
        self.place(block, needed);
        block
      }
      None => self.grow(needed)?,
    };

    let ptr = block.payload();
    log::trace!("allocate({size}) -> {ptr} ({} byte block)", block.size(self.arena.bytes()));
    self.debug_check();
    Ok(Some(ptr))
  }

  /// Returns a block to the free lists, merging it with free neighbours.
  /// `None` is a no-op.
  pub fn free<P: Into<Option<BlockPtr>>>(
    &mut self,
    ptr: P,
  ) {
    let Some(ptr) = ptr.into() else {
      log::trace!("free(null)");
      return;
    };

    let block = Block::from_payload(ptr);
    let bytes = self.arena.bytes_mut();
    let tag = block.tag(bytes);
    block.format_free(bytes, tag.size, tag.prev_allocated);
    block.next(bytes).set_prev_allocated(bytes, false);

    let block = self.coalesce(block);
    self.lists.insert(self.arena.bytes_mut(), block);

    log::trace!(
      "free({ptr}): {} byte free block at {:#x}",
      block.size(self.arena.bytes()),
      block.offset()
    );
    self.debug_check();
  }

  /// Changes the size of an allocation, in place when the neighbourhood
  /// allows it.
  ///
  /// A zero `size` frees `ptr`; a `None` pointer allocates. On error the
  /// original allocation and its contents are left as they were.
  pub fn resize<P: Into<Option<BlockPtr>>>(
    &mut self,
    ptr: P,
    size: usize,
  ) -> Result<Option<BlockPtr>> {
    let ptr = ptr.into();
    if size == 0 {
      self.free(ptr);
      return Ok(None);
    }
    let Some(ptr) = ptr else {
      return self.allocate(size);
    };

    let needed = block::needed_size(size).ok_or(AllocError::RequestTooLarge(size))?;
    let block = Block::from_payload(ptr);
    let bytes = self.arena.bytes();
    let tag = block.tag(bytes);
    let current = tag.size;

    if needed <= current {
      log::trace!("resize({ptr}, {size}): {current} byte block already fits");
      return Ok(Some(ptr));
    }

    let epilogue = self.epilogue();
    let next = block.next(bytes);
    let next_free = next.is_free(bytes);
    let next_size = next.size(bytes);
    let next_is_last = next.next(bytes) == epilogue;

    if next_free && current + next_size >= needed {
      self.lists.remove(self.arena.bytes_mut(), next);
      block.set_header(self.arena.bytes_mut(), Tag::allocated(current + next_size, tag.prev_allocated));
      self.place(block, needed);
      log::trace!("resize({ptr}, {size}): absorbed {next_size} bytes from the next block");
    } else if next_free && next_is_last {
      self.arena.extend(needed - current - next_size)?;
      self.lists.remove(self.arena.bytes_mut(), next);
      self.grow_in_place(block, tag.prev_allocated, needed);
      log::trace!("resize({ptr}, {size}): absorbed the trailing free block and grew the arena");
    } else if next == epilogue {
      self.arena.extend(needed - current)?;
      self.grow_in_place(block, tag.prev_allocated, needed);
      log::trace!("resize({ptr}, {size}): grew the last block in place");
    } else {
      return self.relocate(ptr, size);
    }

    self.debug_check();
    Ok(Some(ptr))
  }

  /// Usable payload bytes of a live allocation.
  ///
  /// Allocated blocks keep no footer, so the payload runs to the end of the
  /// block.
  pub fn usable_size(
    &self,
    ptr: BlockPtr,
  ) -> usize {
    Block::from_payload(ptr).size(self.arena.bytes()) - HEADER_SIZE
  }

  pub fn payload(
    &self,
    ptr: BlockPtr,
  ) -> &[u8] {
    let len = self.usable_size(ptr);
    &self.arena.bytes()[ptr.offset()..ptr.offset() + len]
  }

  pub fn payload_mut(
    &mut self,
    ptr: BlockPtr,
  ) -> &mut [u8] {
    let len = self.usable_size(ptr);
    &mut self.arena.bytes_mut()[ptr.offset()..ptr.offset() + len]
  }

  /// Validates every block and every free list without modifying either.
  pub fn check(&self) -> std::result::Result<(), HeapViolation> {
    self.checker().run()
  }

  pub fn stats(&self) -> HeapStats {
    self.checker().stats()
  }

  /// Every block in the free list index, class by class.
  pub fn free_blocks(&self) -> Vec<FreeBlock> {
    self.checker().free_blocks()
  }

  fn checker(&self) -> HeapChecker<'_> {
    HeapChecker::new(self.arena.bytes(), &self.lists, self.heap_start)
  }

  fn debug_check(&self) {
    if !self.config.check_after_ops {
      return;
    }
    if let Err(violation) = self.check() {
      log::error!("{violation}");
      panic!("{violation}");
    }
  }

  fn epilogue(&self) -> Block {
    Block::at(self.arena.len() - EPILOGUE_SIZE)
  }

  fn write_epilogue(
    bytes: &mut [u8],
    at: Block,
  ) {
    at.set_header(bytes, Tag::allocated(EPILOGUE_SIZE, true));
  }

  /// Extends the arena by `needed` bytes and turns the old epilogue into the
  /// header of a new allocated block.
  fn grow(
    &mut self,
    needed: usize,
  ) -> Result<Block> {
    let block = self.epilogue();
    let prev_allocated = block.prev_allocated(self.arena.bytes());

    self.arena.extend(needed)?;

    let bytes = self.arena.bytes_mut();
    block.set_header(bytes, Tag::allocated(needed, prev_allocated));
    Self::write_epilogue(bytes, Block::at(block.offset() + needed));

    log::debug!("grew arena by {needed} bytes for a block at {:#x}", block.offset());
    Ok(block)
  }

  /// Resizes the last block of the heap to `needed` after the arena has been
  /// extended to cover it.
  fn grow_in_place(
    &mut self,
    block: Block,
    prev_allocated: bool,
    needed: usize,
  ) {
    let bytes = self.arena.bytes_mut();
    block.set_header(bytes, Tag::allocated(needed, prev_allocated));
    Self::write_epilogue(bytes, Block::at(block.offset() + needed));
  }

  fn relocate(
    &mut self,
    ptr: BlockPtr,
    size: usize,
  ) -> Result<Option<BlockPtr>> {
    let Some(new) = self.allocate(size)? else {
      return Ok(None);
    };

    let len = size.min(self.usable_size(ptr));
    self
      .arena
      .bytes_mut()
      .copy_within(ptr.offset()..ptr.offset() + len, new.offset());
    self.free(ptr);

    log::trace!("resize({ptr}, {size}): moved {len} bytes to {new}");
    Ok(Some(new))
  }

  /// Marks a detached block allocated at `needed` bytes, splitting off the
  /// tail as a free block when it is big enough to be worth a header.
  fn place(
    &mut self,
    block: Block,
    needed: usize,
  ) {
    let bytes = self.arena.bytes_mut();
    let tag = block.tag(bytes);

    if tag.size - needed > self.config.split_threshold() {
      block.set_header(bytes, Tag::allocated(needed, tag.prev_allocated));
      let rest = Block::at(block.offset() + needed);
      rest.format_free(bytes, tag.size - needed, true);
      log::trace!(
        "split {} byte block at {:#x}: {needed} allocated, {} free",
        tag.size,
        block.offset(),
        tag.size - needed
      );

      let rest = self.coalesce(rest);
      self.lists.insert(self.arena.bytes_mut(), rest);
    } else {
      block.set_header(bytes, Tag::allocated(tag.size, tag.prev_allocated));
      block.next(bytes).set_prev_allocated(bytes, true);
    }
  }

  /// Merges a free block that is on no list with its free neighbours and
  /// returns the merged block, still unlisted.
  fn coalesce(
    &mut self,
    block: Block,
  ) -> Block {
    let bytes = self.arena.bytes_mut();
    let size = block.size(bytes);
    let prev_free = !block.prev_allocated(bytes);
    let next = block.next(bytes);
    let next_free = next.is_free(bytes);

    let (start, merged) = match (prev_free, next_free) {
      (false, false) => (block, size),
      (true, false) => {
        let prev = block.prev(bytes);
        self.lists.remove(bytes, prev);
        (prev, prev.size(bytes) + size)
      }
      (false, true) => {
        self.lists.remove(bytes, next);
        (block, size + next.size(bytes))
      }
      (true, true) => {
        let prev = block.prev(bytes);
        self.lists.remove(bytes, prev);
        self.lists.remove(bytes, next);
        (prev, prev.size(bytes) + size + next.size(bytes))
      }
    };

    if merged != size {
      log::trace!(
        "coalesce {:#x}: {size} -> {merged} bytes at {:#x}",
        block.offset(),
        start.offset()
      );
    }

    let prev_allocated = start.prev_allocated(bytes);
    start.format_free(bytes, merged, prev_allocated);
    start.next(bytes).set_prev_allocated(bytes, false);
    start
  }

  #[cfg(test)]
  pub(crate) fn arena_bytes_mut(&mut self) -> &mut [u8] {
    self.arena.bytes_mut()
  }
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::{
    block::{MIN_BLOCK_SIZE, OVERHEAD},
    check::ViolationKind,
  };

  fn allocator() -> BlockAllocator<VecArena> {
    allocator_in(VecArena::new())
  }

  fn allocator_in(arena: VecArena) -> BlockAllocator<VecArena> {
    let _ = env_logger::try_init();
    BlockAllocator::init(arena, AllocatorConfig::default().with_check_after_ops(true)).unwrap()
  }

  fn alloc(
    allocator: &mut BlockAllocator<VecArena>,
    size: usize,
  ) -> BlockPtr {
    allocator.allocate(size).unwrap().unwrap()
  }

  fn header(ptr: BlockPtr) -> usize {
    Block::from_payload(ptr).offset()
  }

  fn free_list(allocator: &BlockAllocator<VecArena>) -> Vec<(usize, usize)> {
    let mut blocks: Vec<(usize, usize)> = allocator
      .free_blocks()
      .into_iter()
      .map(|block| (block.offset, block.size))
      .collect();
    blocks.sort();
    blocks
  }

  #[test]
  fn init_lays_out_prologue_and_epilogue() {
    let allocator = allocator();

    assert_eq!(allocator.heap_start, 4 * block::SENTINEL_SIZE);
    assert_eq!(allocator.arena().len(), allocator.heap_start + EPILOGUE_SIZE);
    assert_eq!(allocator.epilogue().offset(), allocator.heap_start);
    assert!(allocator.free_blocks().is_empty());
    allocator.check().unwrap();
  }

  #[test]
  fn init_aligns_a_non_empty_arena() {
    let mut arena = VecArena::new();
    arena.extend(3).unwrap();
    let mut allocator = allocator_in(arena);

    assert_eq!(allocator.heap_start % 8, 0);
    let ptr = alloc(&mut allocator, 10);
    assert_eq!(ptr.offset() % 8, 0);
    allocator.check().unwrap();
  }

  #[test]
  fn init_rejects_invalid_config() {
    let config = AllocatorConfig::default().with_class_thresholds(vec![10, 5]);
    let result = BlockAllocator::init(VecArena::new(), config);
    assert!(matches!(result, Err(AllocError::InvalidConfig(_))));
  }

  #[test]
  fn init_fails_when_the_prologue_does_not_fit() {
    let result = BlockAllocator::new(VecArena::with_limit(16));
    assert!(matches!(result, Err(AllocError::OutOfMemory { .. })));
  }

  #[test]
  fn zero_byte_allocation_is_null() {
    let mut allocator = allocator();
    let before = allocator.arena().len();

    assert_eq!(allocator.allocate(0).unwrap(), None);
    assert_eq!(allocator.arena().len(), before);
  }

  #[test]
  fn oversized_request_is_rejected() {
    let mut allocator = allocator();
    assert!(matches!(
      allocator.allocate(usize::MAX),
      Err(AllocError::RequestTooLarge(_))
    ));
  }

  #[test]
  fn free_null_is_a_no_op() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 32);
    allocator.free(None::<BlockPtr>);
    assert_eq!(allocator.stats().allocated_blocks, 1);
    assert!(allocator.payload(ptr).len() >= 32);
  }

  #[test]
  fn allocations_grow_the_arena_by_the_block_size() {
    let mut allocator = allocator();
    let before = allocator.arena().len();

    let ptr = alloc(&mut allocator, 100);

    assert_eq!(allocator.arena().len(), before + 120);
    assert_eq!(header(ptr), allocator.heap_start);
    assert_eq!(allocator.usable_size(ptr), 112);
  }

  #[test]
  fn freed_block_is_reused_before_growing() {
    let mut allocator = allocator();

    let first = alloc(&mut allocator, 16);
    allocator.free(first);
    let len = allocator.arena().len();
    let second = alloc(&mut allocator, 16);

    assert_eq!(first, second);
    assert_eq!(allocator.arena().len(), len);
  }

  #[test]
  fn adjacent_frees_coalesce_into_one_block() {
    let mut allocator = allocator();

    let first = alloc(&mut allocator, 16);
    let second = alloc(&mut allocator, 16);
    assert_eq!(header(second), header(first) + 32);

    allocator.free(first);
    allocator.free(second);

    assert_eq!(free_list(&allocator), vec![(header(first), 64)]);
    assert_eq!(allocator.stats().free_blocks, 1);
  }

  #[test]
  fn coalesce_with_neither_neighbour() {
    let mut allocator = allocator();
    let _a = alloc(&mut allocator, 16);
    let b = alloc(&mut allocator, 16);
    let _c = alloc(&mut allocator, 16);

    allocator.free(b);

    assert_eq!(free_list(&allocator), vec![(header(b), 32)]);
  }

  #[test]
  fn coalesce_with_previous() {
    let mut allocator = allocator();
    let a = alloc(&mut allocator, 16);
    let b = alloc(&mut allocator, 16);
    let _c = alloc(&mut allocator, 16);

    allocator.free(a);
    allocator.free(b);

    assert_eq!(free_list(&allocator), vec![(header(a), 64)]);
  }

  #[test]
  fn coalesce_with_next() {
    let mut allocator = allocator();
    let a = alloc(&mut allocator, 16);
    let b = alloc(&mut allocator, 16);
    let _c = alloc(&mut allocator, 16);

    allocator.free(b);
    allocator.free(a);

    assert_eq!(free_list(&allocator), vec![(header(a), 64)]);
  }

  #[test]
  fn coalesce_with_both() {
    let mut allocator = allocator();
    let a = alloc(&mut allocator, 16);
    let b = alloc(&mut allocator, 16);
    let c = alloc(&mut allocator, 16);
    let _d = alloc(&mut allocator, 16);

    allocator.free(a);
    allocator.free(c);
    allocator.free(b);

    assert_eq!(free_list(&allocator), vec![(header(a), 96)]);
  }

  #[test]
  fn large_free_block_is_split() {
    let mut allocator = allocator();
    let big = alloc(&mut allocator, 200);
    let _guard = alloc(&mut allocator, 16);
    allocator.free(big);

    let small = alloc(&mut allocator, 16);

    assert_eq!(small, big);
    assert_eq!(allocator.usable_size(small), 32 - HEADER_SIZE);
    let remainder = free_list(&allocator);
    assert_eq!(remainder, vec![(header(big) + 32, 216 - 32)]);
    assert!(remainder[0].1 > OVERHEAD + allocator.config().min_split_payload);
  }

  #[test]
  fn small_leftover_is_not_split() {
    let mut allocator = allocator();
    let big = alloc(&mut allocator, 200);
    let _guard = alloc(&mut allocator, 16);
    allocator.free(big);

    // 216 - 168 = 48 is not above the 56 byte threshold.
    let ptr = alloc(&mut allocator, 150);

    assert_eq!(ptr, big);
    assert_eq!(allocator.usable_size(ptr), 216 - HEADER_SIZE);
    assert!(allocator.free_blocks().is_empty());
  }

  #[test]
  fn split_remainder_lands_in_its_own_class() {
    let mut allocator = allocator();
    let big = alloc(&mut allocator, 3000);
    let _guard = alloc(&mut allocator, 16);
    allocator.free(big);

    alloc(&mut allocator, 100);

    let blocks = allocator.free_blocks();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].size, 3016 - 120);
    assert_eq!(blocks[0].class, 3);
  }

  #[test]
  fn exhaustion_returns_error_and_keeps_free_space_usable() {
    let mut allocator = allocator_in(VecArena::with_limit(4 * block::SENTINEL_SIZE + EPILOGUE_SIZE + 2000));
    let a = alloc(&mut allocator, 1000);
    let _b = alloc(&mut allocator, 100);
    allocator.free(a);
    let stats = allocator.stats();

    let err = allocator.allocate(10_000).unwrap_err();

    assert!(matches!(err, AllocError::OutOfMemory { .. }));
    assert_eq!(allocator.stats(), stats);
    allocator.check().unwrap();

    let small = alloc(&mut allocator, 16);
    assert_eq!(small, a);
  }

  #[test]
  fn resize_to_smaller_keeps_pointer() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 100);

    assert_eq!(allocator.resize(ptr, 10).unwrap(), Some(ptr));
    assert_eq!(allocator.usable_size(ptr), 112);
  }

  #[test]
  fn resize_null_allocates_and_zero_frees() {
    let mut allocator = allocator();

    let ptr = allocator.resize(None::<BlockPtr>, 24).unwrap().unwrap();
    assert_eq!(allocator.stats().allocated_blocks, 1);

    assert_eq!(allocator.resize(ptr, 0).unwrap(), None);
    assert_eq!(allocator.stats().allocated_blocks, 0);
  }

  #[test]
  fn resize_absorbs_free_successor() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 100);
    let next = alloc(&mut allocator, 200);
    let _guard = alloc(&mut allocator, 16);
    allocator.payload_mut(ptr)[..100].fill(0x5A);
    allocator.free(next);
    let len = allocator.arena().len();

    let resized = allocator.resize(ptr, 250).unwrap();

    assert_eq!(resized, Some(ptr));
    assert_eq!(allocator.arena().len(), len);
    assert!(allocator.payload(ptr)[..100].iter().all(|&byte| byte == 0x5A));
    // 120 + 216 = 336, 272 needed, 64 left over is split off.
    assert_eq!(allocator.usable_size(ptr), 272 - HEADER_SIZE);
    assert_eq!(free_list(&allocator), vec![(header(ptr) + 272, 64)]);
  }

  #[test]
  fn resize_absorbs_trailing_free_block_and_grows() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 100);
    let next = alloc(&mut allocator, 100);
    allocator.payload_mut(ptr)[..100].fill(0xC3);
    allocator.free(next);
    let len = allocator.arena().len();

    let resized = allocator.resize(ptr, 1000).unwrap();

    assert_eq!(resized, Some(ptr));
    assert_eq!(allocator.arena().len(), len + 1016 - 240);
    assert_eq!(allocator.usable_size(ptr), 1016 - HEADER_SIZE);
    assert!(allocator.payload(ptr)[..100].iter().all(|&byte| byte == 0xC3));
    assert!(allocator.free_blocks().is_empty());
  }

  #[test]
  fn resize_grows_last_block_in_place() {
    let mut allocator = allocator();
    let _first = alloc(&mut allocator, 16);
    let ptr = alloc(&mut allocator, 100);
    let len = allocator.arena().len();

    let resized = allocator.resize(ptr, 500).unwrap();

    assert_eq!(resized, Some(ptr));
    assert_eq!(allocator.arena().len(), len + 520 - 120);
    assert_eq!(allocator.epilogue().offset(), header(ptr) + 520);
  }

  #[test]
  fn resize_relocates_when_boxed_in() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 100);
    let _guard = alloc(&mut allocator, 16);
    for (i, byte) in allocator.payload_mut(ptr)[..100].iter_mut().enumerate() {
      *byte = i as u8;
    }

    let moved = allocator.resize(ptr, 500).unwrap().unwrap();

    assert_ne!(moved, ptr);
    let payload = allocator.payload(moved);
    assert!((0..100).all(|i| payload[i] == i as u8));
    assert_eq!(free_list(&allocator), vec![(header(ptr), 120)]);
  }

  #[test]
  fn failed_in_place_growth_leaves_block_intact() {
    let limit = 4 * block::SENTINEL_SIZE + EPILOGUE_SIZE + 1024;
    let mut allocator = allocator_in(VecArena::with_limit(limit));
    let ptr = alloc(&mut allocator, 100);
    let next = alloc(&mut allocator, 100);
    allocator.payload_mut(ptr)[..100].fill(0x11);
    allocator.free(next);
    let blocks = free_list(&allocator);

    let err = allocator.resize(ptr, 4000).unwrap_err();

    assert!(matches!(err, AllocError::OutOfMemory { .. }));
    assert_eq!(allocator.usable_size(ptr), 112);
    assert!(allocator.payload(ptr)[..100].iter().all(|&byte| byte == 0x11));
    assert_eq!(free_list(&allocator), blocks);
    allocator.check().unwrap();
  }

  #[test]
  fn failed_relocation_leaves_block_intact() {
    let limit = 4 * block::SENTINEL_SIZE + EPILOGUE_SIZE + 1024;
    let mut allocator = allocator_in(VecArena::with_limit(limit));
    let ptr = alloc(&mut allocator, 100);
    let _guard = alloc(&mut allocator, 16);
    allocator.payload_mut(ptr)[..100].fill(0x22);

    assert!(allocator.resize(ptr, 4000).is_err());

    assert_eq!(allocator.usable_size(ptr), 112);
    assert!(allocator.payload(ptr)[..100].iter().all(|&byte| byte == 0x22));
    assert_eq!(allocator.stats().allocated_blocks, 2);
    allocator.check().unwrap();
  }

  #[test]
  fn check_reports_allocated_bit_on_free_listed_block() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 64);
    let _guard = alloc(&mut allocator, 64);
    allocator.free(ptr);
    allocator.check().unwrap();

    let offset = header(ptr);
    allocator.arena_bytes_mut()[offset] |= 1;

    let violation = allocator.check().unwrap_err();
    assert_eq!(violation.offset, offset);
    assert_eq!(violation.kind, ViolationKind::AllocatedOnFreeList);
  }

  #[test]
  #[should_panic(expected = "heap corruption")]
  fn corruption_is_fatal_when_checking_after_ops() {
    let mut allocator = allocator();
    let ptr = alloc(&mut allocator, 64);
    let _guard = alloc(&mut allocator, 64);
    allocator.free(ptr);

    let block = Block::from_payload(ptr);
    let footer = block.footer(allocator.arena().bytes());
    block::write_word(allocator.arena_bytes_mut(), footer, 0xdead_bee0);

    let _ = allocator.allocate(4000);
  }

  #[cfg(unix)]
  #[test]
  fn works_over_an_mmap_reservation() {
    use crate::arena::MmapArena;

    let mut allocator = BlockAllocator::init(
      MmapArena::reserve(1 << 20).unwrap(),
      AllocatorConfig::default().with_check_after_ops(true),
    )
    .unwrap();

    let ptrs: Vec<BlockPtr> = (1..64)
      .map(|i| allocator.allocate(i * 24).unwrap().unwrap())
      .collect();
    for ptr in ptrs.iter().step_by(2) {
      allocator.free(*ptr);
    }
    let big = allocator.resize(ptrs[1], 10_000).unwrap().unwrap();
    assert!(allocator.payload(big).len() >= 10_000);
    assert!(allocator.allocate(2 << 20).is_err());
    allocator.check().unwrap();
  }

  #[derive(Clone, Debug)]
  enum Op {
    Allocate(usize),
    Free(usize),
    Resize(usize, usize),
  }

  fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
      (1usize..2048).prop_map(Op::Allocate),
      any::<usize>().prop_map(Op::Free),
      (any::<usize>(), 0usize..4096).prop_map(|(i, size)| Op::Resize(i, size)),
    ]
  }

  proptest! {
    /// Random workloads never hand out overlapping or misaligned payloads,
    /// never disturb live data, and leave a single free block once
    /// everything is released.
    #[test]
    fn random_workloads_keep_the_heap_consistent(ops in prop::collection::vec(op(), 1..200)) {
      let mut allocator = allocator();
      // (pointer, requested size, fill byte)
      let mut live: Vec<(BlockPtr, usize, u8)> = Vec::new();

      for (step, op) in ops.into_iter().enumerate() {
        let fill = step as u8;
        match op {
          Op::Allocate(size) => {
            let ptr = alloc(&mut allocator, size);
            allocator.payload_mut(ptr)[..size].fill(fill);
            live.push((ptr, size, fill));
          }
          Op::Free(i) if !live.is_empty() => {
            let (ptr, _, _) = live.swap_remove(i % live.len());
            allocator.free(ptr);
          }
          Op::Resize(i, size) if !live.is_empty() => {
            let (ptr, old_size, old_fill) = live.swap_remove(i % live.len());
            match allocator.resize(ptr, size).unwrap() {
              Some(new) => {
                let kept = old_size.min(size);
                prop_assert!(allocator.payload(new)[..kept].iter().all(|&byte| byte == old_fill));
                allocator.payload_mut(new)[..size].fill(fill);
                live.push((new, size, fill));
              }
              None => prop_assert_eq!(size, 0),
            }
          }
          _ => {}
        }

        prop_assert!(allocator.check().is_ok());

        let mut spans = Vec::with_capacity(live.len());
        for &(ptr, size, byte) in &live {
          let payload = allocator.payload(ptr);
          prop_assert!(payload.len() >= size);
          prop_assert_eq!(ptr.offset() % 8, 0);
          prop_assert_eq!(payload.as_ptr() as usize % 8, 0);
          prop_assert!(payload[..size].iter().all(|&b| b == byte));
          spans.push((ptr.offset(), payload.len()));
        }
        spans.sort();
        for pair in spans.windows(2) {
          prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
      }

      for (ptr, _, _) in live.drain(..) {
        allocator.free(ptr);
      }
      allocator.check().unwrap();
      let stats = allocator.stats();
      prop_assert_eq!(stats.allocated_blocks, 0);
      prop_assert!(stats.free_blocks <= 1);
      if stats.free_blocks == 1 {
        prop_assert!(stats.largest_free >= MIN_BLOCK_SIZE);
        prop_assert_eq!(stats.free_bytes, stats.arena_bytes - allocator.heap_start - EPILOGUE_SIZE);
      }
    }
  }
}
