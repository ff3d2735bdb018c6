//! Exhaustive interleaving check for the free-list ABA mitigation used by
//! `slotpool::ConcurrentPool`.
//!
//! This crate only builds anything under `--cfg loom` (`loom-test` feature);
//! a normal `cargo build`/`cargo test` of the workspace sees an empty crate.
//! Kept standalone, rather than as a `dev-dependency` of `pool`, so loom's
//! own `std` shims never leak into the parent crate's ordinary build — the
//! same reason the reference crate this is modeled on keeps it separate.
//!
//! `loom` doesn't model 128-bit atomics, so the probe can't reuse
//! `portable_atomic::AtomicU128` directly. Instead it reduces the problem
//! to its essential shape: a fixed small array of nodes and a packed
//! `{version: u32, index: u32}` head in a single `loom::sync::atomic::AtomicU64`,
//! which is exactly the same "version rides along with the pointer in one
//! atomic word" trick, just narrower.

#![cfg(loom)]

use loom::sync::atomic::{AtomicU64, Ordering};
use loom::sync::Arc;
use loom::thread;

const NIL: u32 = u32::MAX;

fn pack(version: u32, index: u32) -> u64 {
    ((version as u64) << 32) | index as u64
}

fn unpack(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

/// Three nodes, each node's `next` a plain (non-atomic) cell since only one
/// thread ever touches a given node between a pop and its matching push.
struct Probe {
    next: [loom::cell::UnsafeCell<u32>; 3],
    head: AtomicU64,
}

impl Probe {
    fn new() -> Self {
        // Chain 0 -> 1 -> 2 -> nil.
        let next = [
            loom::cell::UnsafeCell::new(1),
            loom::cell::UnsafeCell::new(2),
            loom::cell::UnsafeCell::new(NIL),
        ];
        Probe {
            next,
            head: AtomicU64::new(pack(0, 0)),
        }
    }

    fn pop(&self) -> Option<u32> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (version, index) = unpack(current);
            if index == NIL {
                return None;
            }
            let next = self.next[index as usize].get().with(|p| unsafe { *p });
            let attempt = pack(version, next);
            match self
                .head
                .compare_exchange_weak(current, attempt, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(index),
                Err(observed) => current = observed,
            }
        }
    }

    fn push(&self, index: u32) {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            let (version, head_index) = unpack(current);
            self.next[index as usize]
                .get_mut()
                .with(|p| unsafe { *p = head_index });
            let attempt = pack(version.wrapping_add(1), index);
            match self
                .head
                .compare_exchange_weak(current, attempt, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Two threads pop, then push back what they popped (a node recycled
/// through the free list while another thread observes the same head
/// value) — the canonical ABA shape. Without the version word, thread A's
/// compare_exchange on a stale `current` could succeed after thread B
/// popped and re-pushed the same node, silently corrupting the chain.
#[test]
fn two_threads_recycle_without_aba_corruption() {
    loom::model(|| {
        let probe = Arc::new(Probe::new());

        let p1 = Arc::clone(&probe);
        let t1 = thread::spawn(move || {
            if let Some(node) = p1.pop() {
                p1.push(node);
            }
        });

        let p2 = Arc::clone(&probe);
        let t2 = thread::spawn(move || {
            if let Some(node) = p2.pop() {
                p2.push(node);
            }
        });

        t1.join().unwrap();
        t2.join().unwrap();

        // After both threads finish, exactly the original three nodes must
        // still be reachable from the head, each exactly once.
        let mut seen = [false; 3];
        let mut current = unpack(probe.head.load(Ordering::Acquire)).1;
        let mut count = 0;
        while current != NIL {
            assert!(!seen[current as usize], "node {current} reachable twice — ABA corruption");
            seen[current as usize] = true;
            current = probe.next[current as usize].get().with(|p| unsafe { *p });
            count += 1;
            assert!(count <= 3, "cycle detected in free list");
        }
        assert_eq!(count, 3, "lost a node during concurrent pop/push");
    });
}
