//! The intrusive slot overlay: a free slot's leading bytes double as the
//! free-list `next` pointer, exactly as in `goodcleanfun/memory_pool`'s
//! `union MEMORY_POOL_TYPED(item) { item *next; TYPE value; }`.

use std::mem::ManuallyDrop;

/// Raw storage for one pool item. While free, `next` is the live field;
/// while handed out, the caller owns `value`. The pool itself never reads
/// `value` and never drops it — callers are responsible for finalizing `T`
/// before releasing a slot, per the pool's raw-storage contract.
#[repr(C)]
pub(crate) union Slot<T> {
    pub(crate) next: *mut Slot<T>,
    pub(crate) value: ManuallyDrop<T>,
}
