use crate::{block::BlockPtr, Pointer};

/// Links of a free block, overlaid on the first two words of its payload.
/// The node address *is* the payload address, so hopping between the list
/// view and the block view of the same memory is just a cast (see
/// [`BlockPtr::node`] and [`BlockPtr::from_node`]):
///
/// ```text
///            +--------------------------+
///            | size | 0                 |
///            +--------------------------+  <-+
///            | next free block          |    |  FreeNode, meaningful only
///            +--------------------------+    |  while the allocated bit is
///            | prev free block          |    |  clear
///            +--------------------------+  <-+
///            | stale caller bytes ...   |
///            +--------------------------+
///            | size | 0                 |
///            +--------------------------+
/// ```
///
/// While a block is allocated the same bytes belong to the caller; freeing
/// hands them back to us, and nobody else should be holding that address
/// anymore. Use after free says otherwise, but that is the caller's bug.
pub(crate) struct FreeNode {
    pub next: Pointer<FreeNode>,
    pub prev: Pointer<FreeNode>,
}

/// The explicit free list: unordered, doubly linked, most recently freed
/// first. One list spans every chunk, so a search never cares which mapping
/// a block lives in. The nodes live inside the free blocks themselves, so
/// the list performs no allocations of its own (we are the allocator).
pub(crate) struct FreeList {
    head: Pointer<FreeNode>,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Pushes `block` at the head. Recently freed blocks get retried first,
    /// which keeps short-lived allocations cycling through warm memory.
    ///
    /// # Safety
    ///
    /// `block` must be a valid free block that is not already on the list.
    pub unsafe fn insert(&mut self, block: BlockPtr) {
        let node = block.node();
        node.as_ptr().write(FreeNode {
            next: self.head,
            prev: None,
        });

        if let Some(head) = self.head {
            (*head.as_ptr()).prev = Some(node);
        }

        self.head = Some(node);
    }

    /// Takes `block` off the list by patching its neighbors around it.
    ///
    /// # Safety
    ///
    /// `block` must currently be on the list.
    pub unsafe fn unlink(&mut self, block: BlockPtr) {
        let node = block.node();
        let FreeNode { next, prev } = node.as_ptr().read();

        if let Some(prev) = prev {
            (*prev.as_ptr()).next = next;
        }
        if let Some(next) = next {
            (*next.as_ptr()).prev = prev;
        }
        if self.head == Some(node) {
            self.head = next;
        }
    }

    /// First fit: the first block from the head able to hold `need` bytes,
    /// tags included. O(list length), but the LIFO ordering means searches
    /// hit recently recycled blocks early.
    ///
    /// # Safety
    ///
    /// Every node on the list must belong to a live free block.
    pub unsafe fn first_fit(&self, need: usize) -> Option<BlockPtr> {
        self.blocks().find(|block| block.size() >= need)
    }

    /// Iterates over the blocks on the list, head first. Holding the
    /// iterator across list mutations is a bug.
    pub fn blocks(&self) -> Blocks {
        Blocks { current: self.head }
    }
}

pub(crate) struct Blocks {
    current: Pointer<FreeNode>,
}

impl Iterator for Blocks {
    type Item = BlockPtr;

    fn next(&mut self) -> Option<BlockPtr> {
        let node = self.current?;
        // SAFETY: nodes reachable from the head are valid free blocks by
        // the insert/unlink contract.
        unsafe {
            self.current = (*node.as_ptr()).next;
            Some(BlockPtr::from_node(node))
        }
    }
}
