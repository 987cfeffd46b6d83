//! # segalloc - A Boundary-Tag Allocator Library
//!
//! This crate provides a general-purpose **boundary-tag allocator** with
//! **segregated free lists**, managing a single contiguous arena that only
//! ever grows at its high end (the way `sbrk` grows a process heap).
//!
//! ## Overview
//!
//! Every block carries its size in a header word. Free blocks also carry a
//! footer, so a block being freed can find and merge with the free block in
//! front of it in constant time:
//!
//! ```text
//!   Arena Layout:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                              ARENA                                   │
//!   │                                                                      │
//!   │   ┌──────────┬───────┬──────────────┬────────┬──────────────┬───┐    │
//!   │   │ prologue │ alloc │     free     │ alloc  │     free     │ E │    │
//!   │   │ sentinels│       │ (class 1)    │        │ (class 3)    │   │    │
//!   │   └──────────┴───────┴──────────────┴────────┴──────────────┴───┘    │
//!   │        │                    ▲                       ▲         ▲      │
//!   │        └── list heads ──────┴───────────────────────┘         │      │
//!   │                                                         epilogue     │
//!   │                                                     (arena end - 8)  │
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   segalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── arena      - ArenaProvider trait, VecArena and MmapArena
//!   ├── block      - Tag encoding and block navigation
//!   ├── free_list  - Size classes and sentinel-headed free lists
//!   ├── allocator  - BlockAllocator: allocate, free, resize
//!   ├── check      - Heap checker and statistics
//!   ├── config     - AllocatorConfig
//!   └── error      - AllocError
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use segalloc::{BlockAllocator, VecArena};
//!
//! fn main() -> segalloc::Result<()> {
//!     let mut allocator = BlockAllocator::new(VecArena::new())?;
//!
//!     // Allocate 64 bytes and write into them
//!     let ptr = allocator.allocate(64)?.expect("non-zero request");
//!     allocator.payload_mut(ptr)[..5].copy_from_slice(b"hello");
//!
//!     // Grow it; the first 64 bytes come along
//!     let ptr = allocator.resize(ptr, 4096)?.expect("non-zero request");
//!     assert_eq!(&allocator.payload(ptr)[..5], b"hello");
//!
//!     allocator.free(ptr);
//!     allocator.check().expect("heap is consistent");
//!     Ok(())
//! }
//! ```
//!
//! ## How It Works
//!
//! Allocation rounds the request up to a block size, then searches the free
//! list of that size class and every larger class, first fit:
//!
//! ```text
//!   allocate(100):  needed = align(100 + 16) = 120
//!
//!   class 0 (< 290)   ──▶ [ 64 ] ──▶ [ 96 ] ──▶ (sentinel)     too small
//!   class 1 (< 540)   ──▶ [ 400 ] ─────────────────────────▶   hit
//!
//!   ┌──────────────── 400 ─────────────────┐
//!   │ 120 (allocated) │    280 (free)      │   split, remainder re-listed
//!   └─────────────────┴────────────────────┘
//! ```
//!
//! When no list has a fit, the arena grows by exactly the block size and the
//! old epilogue word becomes the new block's header.
//!
//! Freeing a block merges it with any free neighbour before it goes back on
//! a list, so two free blocks are never adjacent:
//!
//! ```text
//!   before:  │ free 64 │ alloc 120 │ free 32 │ alloc │
//!   free():  │          free 216             │ alloc │
//! ```
//!
//! ## Features
//!
//! - **Constant-time coalescing**: Boundary tags plus a previous-allocated bit
//! - **Segregated fits**: Configurable size classes, LIFO within a class
//! - **In-place resize**: Absorbs a free successor or grows the arena end
//! - **Heap checker**: Reports the first broken invariant with its offset
//! - **Pluggable arenas**: Bounded `Vec` storage or an `mmap` reservation
//!
//! ## Limitations
//!
//! - **Single-threaded only**: No synchronization primitives
//! - **Never shrinks**: Free space at the arena end is kept, not returned
//! - **8-byte alignment**: No over-aligned requests

pub mod align;
mod allocator;
pub mod arena;
pub mod block;
pub mod check;
pub mod config;
pub mod error;
pub mod free_list;

pub use allocator::BlockAllocator;
#[cfg(unix)]
pub use arena::MmapArena;
pub use arena::{ArenaProvider, VecArena};
pub use block::BlockPtr;
pub use check::{FreeBlock, HeapStats, HeapViolation, ViolationKind};
pub use config::AllocatorConfig;
pub use error::{AllocError, Result};
