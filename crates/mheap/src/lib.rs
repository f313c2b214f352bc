//! Multi-heap user-space memory allocator.
//!
//! This crate manages a small number of independent heaps, each backed by a
//! single byte buffer, and serves variable-sized, aligned allocations out of
//! them. It is intended for callers that want to isolate allocation traffic
//! into separate pools and inspect or validate those pools at runtime.
//!
//! # Components
//!
//! ## [`Heap`](heap::Heap)
//!
//! A single pool with an address-ordered free list embedded in the buffer
//! itself. Allocation uses first-fit or best-fit search; deallocation merges
//! the block with its free neighbours so that no two free fragments are ever
//! adjacent.
//!
//! Every free node and block header carries a tag derived from its own
//! offset and size (see [`Checksum`](address::Checksum)). A tag mismatch is
//! reported as corruption and the heap refuses further work.
//!
//! ## [`HeapManager`](manager::HeapManager)
//!
//! Owns up to 16 heaps and tracks the *active* one. Frees may name their
//! heap implicitly: the manager finds the owner by address, switches to it
//! for the duration of the call and switches back.
//!
//! # Usage Example
//!
//! ```rust
//! use mheap::{
//!     heap::FitStrategy,
//!     manager::{HeapConfig, HeapManager},
//! };
//!
//! let configs = [
//!     HeapConfig::new("small", 64 * 1024).with_strategy(FitStrategy::FirstFit),
//!     HeapConfig::new("large", 1024 * 1024),
//! ];
//! let mut manager: HeapManager = HeapManager::new(&configs)?;
//!
//! manager.use_heap_named("small")?;
//! let addr = manager.alloc(100, 16)?;
//! manager.payload_mut(addr, 100).unwrap().fill(0xaa);
//!
//! manager.use_heap_named("large")?;
//! manager.free(addr)?;
//! assert_eq!(manager.active_heap().name(), "large");
//!
//! for heap in manager.heaps() {
//!     heap.check_invariants()?;
//!     println!("{}", heap.dump());
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Thread Safety
//!
//! Heaps and managers are plain owned values mutated through `&mut self`.
//! Wrap them in a lock to share them between threads.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod address;
pub mod dump;
pub mod error;
pub mod heap;
mod layout;
pub mod manager;

pub use self::{
    address::HeapAddr,
    heap::{FitStrategy, Heap, HeapError},
    manager::{HeapConfig, HeapManager, ManagerError},
};
