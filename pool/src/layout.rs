//! Block geometry and the crate's binding of the external
//! `aligned_alloc`/`aligned_free` primitive (`std::alloc`).

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Computed geometry for one block: where the slot array starts relative to
/// the block's base address, how many bytes apart consecutive slots are,
/// and the `Layout` used to allocate and later free the block.
///
/// The block's base address is a multiple of `block_size` (not of the slot
/// stride) per the alignment contract: this leaves the door open for a
/// future `slot -> containing block` computation via masking the low bits
/// of a slot address, even though nothing in this crate currently does that.
#[derive(Clone, Copy)]
pub(crate) struct BlockGeometry {
    pub(crate) block_size: usize,
    pub(crate) stride: usize,
    data_offset: usize,
    layout: Layout,
}

impl BlockGeometry {
    /// `header_size`/`header_align` describe the per-variant block header
    /// (`single::BlockHeader` or `concurrent::AtomicBlockHeader`); `stride`
    /// is the already-widened per-slot byte count (see `slot::Slot`).
    pub(crate) fn new(
        header_size: usize,
        header_align: usize,
        slot_align: usize,
        block_size: usize,
        stride: usize,
    ) -> Option<Self> {
        debug_assert!(block_size.is_power_of_two());

        let data_align = header_align.max(slot_align);
        let data_offset = round_up(header_size, data_align);
        let data_size = stride.checked_mul(block_size)?;
        let total_size = data_offset.checked_add(data_size)?;

        let layout = Layout::from_size_align(total_size, block_size).ok()?;

        Some(Self {
            block_size,
            stride,
            data_offset,
            layout,
        })
    }

    /// Allocate one block of this geometry. Mirrors `aligned_alloc(size, alignment)`.
    pub(crate) fn alloc_block(&self) -> Option<NonNull<u8>> {
        // SAFETY: `self.layout` has non-zero size (it includes at least
        // `data_offset`, the header) and a power-of-two alignment.
        let ptr = unsafe { alloc::alloc(self.layout) };
        NonNull::new(ptr)
    }

    /// Release one block of this geometry. Mirrors `aligned_free(ptr)`.
    ///
    /// # Safety
    /// `block` must have been returned by `alloc_block` on a geometry equal
    /// to `self`, and must not be used again afterwards.
    pub(crate) unsafe fn dealloc_block(&self, block: NonNull<u8>) {
        unsafe { alloc::dealloc(block.as_ptr(), self.layout) };
    }

    /// Raw pointer to the `index`-th slot's storage within `block`.
    ///
    /// # Safety
    /// `block` must point at a block allocated with this geometry, and
    /// `index` must be `< self.block_size`.
    pub(crate) unsafe fn slot_ptr<T>(&self, block: NonNull<u8>, index: usize) -> NonNull<T> {
        let offset = self.data_offset + index * self.stride;
        unsafe { NonNull::new_unchecked(block.as_ptr().add(offset).cast()) }
    }
}

fn round_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}
