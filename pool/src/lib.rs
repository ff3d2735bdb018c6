//! A typed, block-growing object pool.
//!
//! Two variants share the same block/slot geometry (see [`layout`] and
//! [`slot`]):
//!
//! - [`Pool`]: single-threaded, `&mut self` receivers, a plain intrusive
//!   free list.
//! - [`ConcurrentPool`]: lock-free for any number of concurrent callers,
//!   `&self` receivers, a versioned free list plus an atomic bump cursor
//!   and a spinlock-arbitrated growth path.
//!
//! Both grow by allocating one more fixed-size block whenever the current
//! one is exhausted, and never shrink or free blocks individually — the
//! whole chain is released together when the pool drops.

mod concurrent;
mod layout;
mod single;
mod slot;

pub use concurrent::ConcurrentPool;
pub use single::Pool;

/// Slot count per block used by `new()` on either pool variant.
pub const DEFAULT_BLOCK_SIZE: usize = 256;
