use std::{mem, ptr::NonNull};

use crate::{align::ALIGNMENT, freelist::FreeNode, tag};

/// Machine word size in bytes. Boundary tags are one word each.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// Combined size of the header and footer tags of one block.
pub(crate) const OVERHEAD: usize = 2 * WORD;

/// Smallest legal block: both tags plus enough payload to host a
/// [`FreeNode`] once the block is freed.
pub(crate) const MIN_BLOCK_SIZE: usize = OVERHEAD + mem::size_of::<FreeNode>();

// A free block's payload doubles as its list node, so one alignment unit of
// payload must hold the two links exactly.
const _: () = assert!(mem::size_of::<FreeNode>() == ALIGNMENT);
const _: () = assert!(MIN_BLOCK_SIZE % ALIGNMENT == 0);

/// Handle to one block, addressed by its payload, which is the same address
/// the caller receives. Everything else is reachable from there with word
/// arithmetic:
///
/// ```text
///              +---------------------+
/// header  ->   | size | alloc bit    |  <- one word, payload - 1w
///              +---------------------+
/// payload ->   |                     |  <- size - 2w bytes; doubles as the
///              |     caller bytes    |     free list node while the block
///              |                     |     is free
///              +---------------------+
/// footer  ->   | size | alloc bit    |  <- copy of the header,
///              +---------------------+     payload + size - 2w
/// ```
///
/// The next block's payload sits at `payload + size`; the previous block's
/// payload is found through the word immediately before our header, which
/// is the previous block's footer. All accessors are raw reads and writes;
/// no reference into block memory is ever created, so we never alias the
/// caller's own pointers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockPtr(NonNull<u8>);

impl BlockPtr {
    /// Rebuilds the handle from an address previously produced by
    /// [`BlockPtr::payload`].
    ///
    /// # Safety
    ///
    /// `payload` must point one word past a valid header tag. This mostly
    /// runs on addresses coming back through `dealloc`, so it holds as long
    /// as the caller frees only what was allocated.
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        Self(payload)
    }

    /// The address handed to the caller on allocation.
    #[inline]
    pub fn payload(self) -> NonNull<u8> {
        self.0
    }

    #[inline]
    unsafe fn header_ptr(self) -> *mut usize {
        self.0.as_ptr().sub(WORD).cast()
    }

    /// Raw header word.
    #[inline]
    pub unsafe fn header(self) -> usize {
        self.header_ptr().read()
    }

    /// Raw footer word. The live code only ever writes footers through
    /// [`BlockPtr::set_tags`]; tests read them back to cross-check the
    /// header.
    #[cfg(test)]
    pub unsafe fn footer(self) -> usize {
        self.0.as_ptr().add(self.size() - OVERHEAD).cast::<usize>().read()
    }

    /// Block size in bytes, tags included.
    #[inline]
    pub unsafe fn size(self) -> usize {
        tag::size(self.header())
    }

    #[inline]
    pub unsafe fn is_allocated(self) -> bool {
        tag::is_allocated(self.header())
    }

    /// Writes both boundary tags. The footer lands `size` bytes into the
    /// block, so retagging and resizing happen in one call.
    pub unsafe fn set_tags(self, size: usize, allocated: bool) {
        let word = tag::pack(size, allocated);
        self.header_ptr().write(word);
        self.0.as_ptr().add(size - OVERHEAD).cast::<usize>().write(word);
    }

    /// The block immediately after this one. Lands on the terminator's
    /// pseudo payload when `self` is the last interior block of its chunk.
    #[inline]
    pub unsafe fn next(self) -> BlockPtr {
        Self(NonNull::new_unchecked(self.0.as_ptr().add(self.size())))
    }

    /// The block immediately before this one, located through its footer.
    /// Lands on the sentinel when `self` is the first interior block of its
    /// chunk.
    #[inline]
    pub unsafe fn prev(self) -> BlockPtr {
        let footer = self.0.as_ptr().sub(OVERHEAD).cast::<usize>().read();
        Self(NonNull::new_unchecked(self.0.as_ptr().sub(tag::size(footer))))
    }

    /// The free list node overlaid on this block's payload. Only meaningful
    /// while the allocated bit is clear.
    #[inline]
    pub unsafe fn node(self) -> NonNull<FreeNode> {
        self.0.cast()
    }

    /// Inverse of [`BlockPtr::node`].
    #[inline]
    pub unsafe fn from_node(node: NonNull<FreeNode>) -> Self {
        Self(node.cast())
    }
}
