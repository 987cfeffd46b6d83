use std::io::Read;

use segalloc::{AllocatorConfig, ArenaProvider, BlockAllocator, BlockPtr, VecArena};

/// Waits until the user presses ENTER, but only when run with `--step`.
/// Useful when you want to read each heap state before the next operation
/// changes it.
fn block_until_enter_pressed(step: bool) {
  if !step {
    return;
  }
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints the arena size, the occupancy summary and every free block.
fn print_heap(
  label: &str,
  allocator: &BlockAllocator<VecArena>,
) {
  println!("[{label}] arena = {:#x} bytes, {}", allocator.arena().len(), allocator.stats());
  for block in allocator.free_blocks() {
    println!(
      "    free block at {:#x}: {} bytes, class {}",
      block.offset, block.size, block.class
    );
  }
}

fn print_alloc(
  allocator: &BlockAllocator<VecArena>,
  requested: usize,
  ptr: BlockPtr,
) {
  println!(
    "    requested {requested} bytes -> payload at {ptr}, {} usable",
    allocator.usable_size(ptr)
  );
}

fn main() -> segalloc::Result<()> {
  env_logger::init();
  let step = std::env::args().any(|arg| arg == "--step");

  let config = AllocatorConfig::default().with_check_after_ops(true);
  let mut allocator = BlockAllocator::init(VecArena::new(), config)?;

  print_heap("start", &allocator);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 1) Three small allocations. The lists are empty, so each one grows
  //    the arena by exactly its block size.
  // --------------------------------------------------------------------
  println!("\n[1] Allocate 24, 100 and 24 bytes");
  let mut ptrs = Vec::new();
  for size in [24, 100, 24] {
    let Some(ptr) = allocator.allocate(size)? else {
      unreachable!("non-zero request");
    };
    print_alloc(&allocator, size, ptr);
    ptrs.push(ptr);
  }
  let (first, middle, last) = (ptrs[0], ptrs[1], ptrs[2]);
  allocator.payload_mut(middle)[..4].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
  print_heap("1", &allocator);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 2) Free the first and middle blocks. The second free merges with the
  //    first, leaving one free block.
  // --------------------------------------------------------------------
  println!("\n[2] Free the first and the middle block");
  allocator.free(first);
  allocator.free(middle);
  print_heap("2", &allocator);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 3) A small request is carved out of the merged block; the rest stays
  //    on a free list.
  // --------------------------------------------------------------------
  println!("\n[3] Allocate 16 bytes (split the merged block)");
  if let Some(ptr) = allocator.allocate(16)? {
    print_alloc(&allocator, 16, ptr);
    println!("    reused the freed space? {}", ptr == first);
  }
  print_heap("3", &allocator);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 4) Grow the last block. It sits at the arena end, so it grows in
  //    place and keeps its address.
  // --------------------------------------------------------------------
  println!("\n[4] Resize the last block to 4 KiB");
  if let Some(ptr) = allocator.resize(last, 4096)? {
    println!("    {last} -> {ptr} (moved: {})", ptr != last);
  }
  print_heap("4", &allocator);
  block_until_enter_pressed(step);

  // --------------------------------------------------------------------
  // 5) Check the heap and report.
  // --------------------------------------------------------------------
  match allocator.check() {
    Ok(()) => println!("\n[5] Heap check passed"),
    Err(violation) => println!("\n[5] {violation}"),
  }

  Ok(())
}
