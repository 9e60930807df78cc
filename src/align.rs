use std::mem;

use crate::block::{MIN_BLOCK_SIZE, OVERHEAD};

/// Alignment of every payload pointer handed to the caller. Block sizes are
/// always multiples of this, which keeps the low four bits of every boundary
/// tag free for flags.
pub(crate) const ALIGNMENT: usize = 16;

// Two words per alignment unit: a pair of free list links fits in exactly
// one unit, and the size field of a tag never reaches into the flag bits.
const _: () = assert!(ALIGNMENT == 2 * mem::size_of::<usize>());

/// Rounds `size` up to the next multiple of [`ALIGNMENT`], or `None` when
/// the round-up does not fit in a `usize`.
#[inline]
pub(crate) fn align_up(size: usize) -> Option<usize> {
    Some(size.checked_add(ALIGNMENT - 1)? & !(ALIGNMENT - 1))
}

/// Rounds `size` up to the next multiple of `page_size` (a power of two).
#[inline]
pub(crate) fn page_align(size: usize, page_size: usize) -> Option<usize> {
    Some(size.checked_add(page_size - 1)? & !(page_size - 1))
}

/// Aligned block size able to serve a request of `request` payload bytes,
/// tags included. Requests below one alignment unit are padded up to
/// [`MIN_BLOCK_SIZE`] so the block can host a free list node once it comes
/// back. `None` means the size math itself overflows; callers report that
/// as out of memory.
#[inline]
pub(crate) fn block_size_for(request: usize) -> Option<usize> {
    let need = align_up(request.checked_add(OVERHEAD)?)?;
    Some(need.max(MIN_BLOCK_SIZE))
}
