//! Lock-free concurrent block-growing pool.
//!
//! Three paths cooperate, as in `goodcleanfun/memory_pool`'s
//! `MEMORY_POOL_THREAD_SAFE` branch:
//!
//! - the free-list fast path, a Treiber stack guarded by a versioned
//!   double-wide CAS (`portable_atomic::AtomicU128`) so a slot that is
//!   popped, released, and popped again between two observations of the
//!   same thread is never mistaken for "unchanged";
//! - the bump-pointer slow path, an `AtomicUsize` per block claimed with
//!   `fetch_add`;
//! - the growth arbiter, a `spin::Mutex` try-lock that lets exactly one
//!   thread install the next block per exhaustion event (the spec's
//!   reference design — see `DESIGN.md` for why the alternative rwlock
//!   variant from the original source was not ported).

use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use portable_atomic::AtomicU128;

use crate::layout::BlockGeometry;
use crate::slot::Slot;
use crate::DEFAULT_BLOCK_SIZE;

/// Header prepended to every block in the concurrent pool: the link to the
/// previous head of the block chain, plus the per-block bump counter.
#[repr(C)]
struct AtomicBlockHeader {
    next: AtomicPtr<u8>,
    block_index: AtomicUsize,
}

/// A typed object pool safe for unbounded concurrent `acquire`/`release`
/// from many native OS threads.
///
/// Blocks are never freed individually and the pool never shrinks; a slot
/// pointer handed out by `acquire` stays valid until the whole pool drops.
pub struct ConcurrentPool<T> {
    geometry: BlockGeometry,
    head_block: AtomicPtr<u8>,
    /// Packed `{version: u64, node: *mut Slot<T>}`, see `pack`/`unpack`.
    free_list: AtomicU128,
    block_change_lock: spin::Mutex<()>,
    num_blocks: AtomicUsize,
    _marker: std::marker::PhantomData<T>,
}

// SAFETY: every field is either an atomic or guarded by one; slot ownership
// is handed off exclusively through the free-list CAS and the block-index
// fetch_add, so sharing a `&ConcurrentPool<T>` across threads is sound for
// any `T: Send`.
unsafe impl<T: Send> Send for ConcurrentPool<T> {}
unsafe impl<T: Send> Sync for ConcurrentPool<T> {}

fn pack<T>(version: u64, node: *mut Slot<T>) -> u128 {
    ((version as u128) << 64) | (node as usize as u128)
}

fn unpack<T>(packed: u128) -> (u64, *mut Slot<T>) {
    let version = (packed >> 64) as u64;
    let node = (packed as usize) as *mut Slot<T>;
    (version, node)
}

/// # Safety
/// `block` must point at freshly allocated, otherwise-uninitialized storage
/// at least `size_of::<AtomicBlockHeader>()` bytes long.
unsafe fn init_header(block: NonNull<u8>, next: *mut u8, block_index: usize) {
    let header = block.as_ptr().cast::<AtomicBlockHeader>();
    unsafe {
        ptr::addr_of_mut!((*header).next).write(AtomicPtr::new(next));
        ptr::addr_of_mut!((*header).block_index).write(AtomicUsize::new(block_index));
    }
}

/// # Safety
/// `block` must point at a block previously initialized with `init_header`,
/// still alive for `'a`.
unsafe fn header<'a>(block: NonNull<u8>) -> &'a AtomicBlockHeader {
    unsafe { &*block.as_ptr().cast::<AtomicBlockHeader>() }
}

impl<T> ConcurrentPool<T> {
    /// Create a pool with `block_size = 256` and `type_size = size_of::<T>()`.
    pub fn new() -> Option<Self> {
        Self::with_sizing(DEFAULT_BLOCK_SIZE, mem::size_of::<T>())
    }

    /// Create a pool with an explicit block size and slot byte size.
    ///
    /// Returns `None` if `block_size` is not a power of two, or if the
    /// first block could not be allocated.
    pub fn with_sizing(block_size: usize, type_size: usize) -> Option<Self> {
        if !block_size.is_power_of_two() {
            return None;
        }
        let stride = type_size.max(mem::size_of::<Slot<T>>());
        let geometry = BlockGeometry::new(
            mem::size_of::<AtomicBlockHeader>(),
            mem::align_of::<AtomicBlockHeader>(),
            mem::align_of::<Slot<T>>(),
            block_size,
            stride,
        )?;

        let head_block = geometry.alloc_block()?;
        unsafe { init_header(head_block, ptr::null_mut(), 0) };

        tracing::debug!(block_size, type_size, stride, "concurrent pool created");

        Some(Self {
            geometry,
            head_block: AtomicPtr::new(head_block.as_ptr()),
            free_list: AtomicU128::new(pack::<T>(0, ptr::null_mut())),
            block_change_lock: spin::Mutex::new(()),
            num_blocks: AtomicUsize::new(1),
            _marker: std::marker::PhantomData,
        })
    }

    /// Hand out one slot. Tries the free list first, then the bump cursor
    /// of the current head block, arbitrating growth if the head block is
    /// exhausted. Returns `None` only on allocation failure of a new block.
    pub fn acquire(&self) -> Option<NonNull<T>> {
        // Free-list fast path: versioned CAS pop.
        let mut current = self.free_list.load(Ordering::Acquire);
        loop {
            let (version, node) = unpack::<T>(current);
            let Some(node) = NonNull::new(node) else {
                break;
            };
            let next = unsafe { (*node.as_ptr()).next };
            let attempt = pack(version, next);
            match self.free_list.compare_exchange_weak(
                current,
                attempt,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!("acquired from free list");
                    return Some(node.cast());
                }
                Err(observed) => current = observed,
            }
        }

        // Bump-pointer path, with growth arbitration on exhaustion.
        loop {
            let block_ptr = self.head_block.load(Ordering::Acquire);
            // SAFETY: `head_block` always points at a live, initialized block.
            let block = unsafe { NonNull::new_unchecked(block_ptr) };
            let head = unsafe { header(block) };
            let index = head.block_index.fetch_add(1, Ordering::AcqRel);

            if index < self.geometry.block_size {
                let slot = unsafe { self.geometry.slot_ptr::<T>(block, index) };
                return Some(slot);
            }

            match self.block_change_lock.try_lock() {
                None => {
                    // Another thread is already growing; retry the block path.
                    std::hint::spin_loop();
                    continue;
                }
                Some(_guard) => {
                    let current_ptr = self.head_block.load(Ordering::Acquire);
                    let current_block = unsafe { NonNull::new_unchecked(current_ptr) };
                    let current_header = unsafe { header(current_block) };
                    if current_header.block_index.load(Ordering::Acquire) < self.geometry.block_size
                    {
                        // Another thread already grew the pool while we were
                        // waiting for the lock; release and retry.
                        continue;
                    }

                    let new_block = self.geometry.alloc_block()?;
                    // Pre-claim slot 0 for this thread: the new block starts
                    // with block_index = 1.
                    unsafe { init_header(new_block, current_ptr, 1) };
                    let slot = unsafe { self.geometry.slot_ptr::<T>(new_block, 0) };

                    self.head_block.store(new_block.as_ptr(), Ordering::Release);
                    let grown = self.num_blocks.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(num_blocks = grown, "concurrent pool grew");

                    return Some(slot);
                }
            }
        }
    }

    /// Push a previously-acquired slot back onto the free list.
    ///
    /// Always succeeds given a valid `NonNull<T>` — the `bool` return
    /// mirrors the original sentinel-based contract for interface symmetry.
    ///
    /// # Safety
    /// `slot` must have come from this pool via `acquire` and must not
    /// currently be on the free list.
    pub unsafe fn release(&self, slot: NonNull<T>) -> bool {
        let slot_ptr: *mut Slot<T> = slot.cast().as_ptr();
        let mut current = self.free_list.load(Ordering::Acquire);
        loop {
            let (version, node) = unpack::<T>(current);
            unsafe {
                (*slot_ptr).next = node;
            }
            let attempt = pack(version.wrapping_add(1), slot_ptr);
            match self.free_list.compare_exchange_weak(
                current,
                attempt,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::trace!("released to free list");
                    return true;
                }
                Err(observed) => current = observed,
            }
        }
    }

    /// Number of blocks currently owned by this pool. Monotonically
    /// increasing over the pool's lifetime.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks.load(Ordering::Relaxed)
    }

    /// Configured slot count per block.
    pub fn block_size(&self) -> usize {
        self.geometry.block_size
    }

    /// Walk the free list and count its length.
    ///
    /// # Safety
    /// Only meaningful when no other thread is concurrently mutating the
    /// free list — for tests and diagnostics, not a synchronized query.
    pub unsafe fn free_list_len_unsync(&self) -> usize {
        let (_, mut current) = unpack::<T>(self.free_list.load(Ordering::Acquire));
        let mut count = 0;
        while let Some(node) = NonNull::new(current) {
            count += 1;
            current = unsafe { (*node.as_ptr()).next };
        }
        count
    }
}

impl<T> Drop for ConcurrentPool<T> {
    fn drop(&mut self) {
        let mut current = NonNull::new(*self.head_block.get_mut());
        while let Some(block) = current {
            let next = unsafe { header(block).next.load(Ordering::Relaxed) };
            unsafe {
                self.geometry.dealloc_block(block);
            }
            current = NonNull::new(next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[repr(C)]
    #[allow(dead_code)]
    struct Node {
        value: u32,
        left: *mut Node,
        right: *mut Node,
    }

    #[test]
    fn rejects_non_power_of_two_block_size() {
        assert!(ConcurrentPool::<Node>::with_sizing(100, mem::size_of::<Node>()).is_none());
        assert!(ConcurrentPool::<Node>::with_sizing(256, mem::size_of::<Node>()).is_some());
    }

    #[test]
    fn grows_at_boundary() {
        let pool = ConcurrentPool::<Node>::with_sizing(256, mem::size_of::<Node>()).unwrap();
        for _ in 0..pool.block_size() {
            pool.acquire().expect("slot within first block");
        }
        assert_eq!(pool.num_blocks(), 1);

        assert!(pool.acquire().is_some());
        assert_eq!(pool.num_blocks(), 2);
    }

    #[test]
    fn single_threaded_lifo_recycle() {
        let pool = ConcurrentPool::<Node>::new().unwrap();
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        unsafe {
            pool.release(a);
            pool.release(b);
        }
        assert_eq!(pool.acquire().unwrap(), b);
        assert_eq!(pool.acquire().unwrap(), a);
    }

    #[test]
    fn concurrent_acquire_only_has_no_duplicates() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let pool = Arc::new(ConcurrentPool::<Node>::with_sizing(256, mem::size_of::<Node>()).unwrap());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    let mut acquired = Vec::with_capacity(PER_THREAD);
                    for _ in 0..PER_THREAD {
                        acquired.push(pool.acquire().expect("allocation should not fail") as usize);
                    }
                    acquired
                })
            })
            .collect();

        let mut seen = HashSet::with_capacity(THREADS * PER_THREAD);
        for handle in handles {
            for addr in handle.join().unwrap() {
                assert!(seen.insert(addr), "duplicate slot address handed out");
            }
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }

    #[test]
    fn concurrent_acquire_release_cycles_have_bounded_free_list() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;

        let pool = Arc::new(ConcurrentPool::<Node>::with_sizing(256, mem::size_of::<Node>()).unwrap());
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let slot = pool.acquire().expect("allocation should not fail");
                        unsafe {
                            pool.release(slot);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let len = unsafe { pool.free_list_len_unsync() };
        assert!(len <= THREADS * PER_THREAD);
    }
}
