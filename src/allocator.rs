use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::Mutex,
};

use crate::{
    align::{self, ALIGNMENT},
    block::{BlockPtr, MIN_BLOCK_SIZE},
    chunk, freelist::FreeList, platform,
};

/// Ceiling for the geometric mapping growth: one mapping never asks for
/// more than this many pages ahead of demand.
const MAX_PAGE_PER_MAP: usize = 32;

/// The allocator proper: one explicit free list threaded through every
/// chunk, plus the counters steering chunk lifetime.
///
/// Allocation sizes the request up to a whole block, runs a first-fit
/// search over the free list and, on a miss, maps a fresh chunk sized by a
/// doubling page multiplier. The winning block is split when the tail can
/// stand on its own. Freeing clears the tags, merges with whichever
/// neighbors are free, and returns the chunk to the OS once its whole
/// interior is a single free block. The last chunk is exempt: it stays
/// mapped as a warm pool so a process bouncing between empty and busy does
/// not thrash the pager.
///
/// A single mutator at a time: every method takes `&mut self` and runs to
/// completion. Wrap the instance in a lock, as [`Challoc`] does, when more
/// than one thread allocates. Reentrancy (signal handlers included) is not
/// supported.
///
/// There is no [`Drop`] impl: live chunks stay mapped until the process
/// exits and the OS reclaims them wholesale.
pub struct ChunkAllocator {
    /// Free blocks across all chunks, most recently freed first.
    free: FreeList,
    /// Live mappings currently held.
    chunks: usize,
    /// Pages to request on the next mapping. Doubles on every mapping up to
    /// [`MAX_PAGE_PER_MAP`] and never shrinks, not even when chunks are
    /// unmapped: a long-lived process that briefly spikes keeps its
    /// amortized mapping rate.
    map_multiplier: usize,
    /// Page size reported by the pager, cached on first use.
    page_size: usize,
}

impl ChunkAllocator {
    /// A fresh allocator. Nothing is mapped until the first allocation.
    pub const fn new() -> Self {
        Self {
            free: FreeList::new(),
            chunks: 0,
            map_multiplier: 1,
            page_size: 0,
        }
    }

    /// Number of OS mappings currently held.
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    fn page_size(&mut self) -> usize {
        if self.page_size == 0 {
            self.page_size = platform::page_size();
        }

        self.page_size
    }

    /// Allocates `size` bytes and returns the payload address, or null when
    /// the pager refuses the mapping or the size math overflows. The
    /// address is 16-byte aligned and `size` bytes are writable behind it.
    ///
    /// # Safety
    ///
    /// No other call on this instance may be in flight, and the returned
    /// memory must be released through [`ChunkAllocator::dealloc`] on this
    /// same instance.
    pub unsafe fn alloc(&mut self, size: usize) -> *mut u8 {
        let Some(need) = align::block_size_for(size) else {
            return ptr::null_mut();
        };

        let block = match self.free.first_fit(need) {
            Some(block) => block,
            None => {
                if self.extend(need).is_none() {
                    return ptr::null_mut();
                }
                // Extend just published a block of at least `need` bytes at
                // the head of the list.
                self.free.first_fit(need).unwrap_unchecked()
            }
        };

        self.place(block, need);

        block.payload().as_ptr()
    }

    /// Releases a payload pointer previously produced by
    /// [`ChunkAllocator::alloc`].
    ///
    /// # Safety
    ///
    /// `payload` must come from `alloc` on this instance and must not have
    /// been freed since. Foreign pointers and double frees are undefined
    /// behavior; nothing here validates them.
    pub unsafe fn dealloc(&mut self, payload: *mut u8) {
        let block = BlockPtr::from_payload(NonNull::new_unchecked(payload));
        block.set_tags(block.size(), false);

        let merged = self.coalesce(block);

        if self.chunks > 1 {
            self.release_whole_chunk(merged);
        }
    }

    /// Maps a new chunk able to host one block of `need` bytes. The mapping
    /// length is the larger of what `need` requires and the geometric wish,
    /// so a run of small allocations still gets exponentially fewer
    /// mappings. The fresh interior goes onto the free list as one block.
    unsafe fn extend(&mut self, need: usize) -> Option<BlockPtr> {
        let page_size = self.page_size();
        let required = chunk::required_length(need, page_size)?;
        let length = required.max(self.map_multiplier * page_size);

        // Advance the multiplier before asking: a refused mapping still
        // leaves the next attempt asking bigger.
        if self.map_multiplier < MAX_PAGE_PER_MAP {
            self.map_multiplier *= 2;
        }

        let base = platform::map_pages(length)?;
        self.chunks += 1;

        let block = chunk::frame(base, length);
        self.free.insert(block);

        Some(block)
    }

    /// Carves `need` bytes out of `block`, splitting off the tail whenever
    /// the remainder can stand as a block of its own, then marks the result
    /// allocated and takes it off the free list.
    unsafe fn place(&mut self, block: BlockPtr, need: usize) {
        let remainder = block.size() - need;

        if remainder >= MIN_BLOCK_SIZE {
            block.set_tags(need, false);
            let rest = block.next();
            rest.set_tags(remainder, false);
            self.free.insert(rest);
        }

        block.set_tags(block.size(), true);
        self.free.unlink(block);
    }

    /// Immediate coalescing: merges `block` with whichever neighbors are
    /// free and returns the merged block. The sentinel and terminator are
    /// permanently allocated, so both lookups are safe even at chunk
    /// borders and neither ever merges. On return the result is free, on
    /// the list exactly once, and has no free neighbor.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let left = block.prev();
        let right = block.next();

        match (left.is_allocated(), right.is_allocated()) {
            // No free neighbor: the block joins the list as is.
            (true, true) => {
                self.free.insert(block);
                block
            }
            // Left free: it swallows the block and keeps its list spot.
            (false, true) => {
                left.set_tags(left.size() + block.size(), false);
                left
            }
            // Right free: the block swallows it and takes its place.
            (true, false) => {
                block.set_tags(block.size() + right.size(), false);
                self.free.unlink(right);
                self.free.insert(block);
                block
            }
            // Both free: the left one swallows everything.
            (false, false) => {
                left.set_tags(left.size() + block.size() + right.size(), false);
                self.free.unlink(right);
                left
            }
        }
    }

    /// If `merged` covers an entire chunk's interior, hands that chunk back
    /// to the OS. The caller keeps the last chunk out of here.
    unsafe fn release_whole_chunk(&mut self, merged: BlockPtr) {
        let Some((base, length)) = chunk::spanned_by(merged) else {
            return;
        };

        self.free.unlink(merged);
        platform::unmap_pages(base, length);
        self.chunks -= 1;
    }

    /// Returns every fully idle chunk to the pager, the warm one included.
    /// Only tests need this: it keeps Miri's leak checker quiet at scope
    /// exit.
    #[cfg(test)]
    unsafe fn purge(&mut self) {
        let idle: Vec<BlockPtr> = self
            .free
            .blocks()
            .filter(|block| chunk::spanned_by(*block).is_some())
            .collect();

        for block in idle {
            let (base, length) = chunk::spanned_by(block).unwrap();
            self.free.unlink(block);
            platform::unmap_pages(base, length);
            self.chunks -= 1;
        }
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread safe facade over [`ChunkAllocator`], usable as the program's
/// `#[global_allocator]`. All it adds is a [`Mutex`]; the engine itself
/// stays single-mutator.
///
/// # Examples
///
/// ```rust
/// use std::alloc::{GlobalAlloc, Layout};
///
/// use challoc::Challoc;
///
/// let challoc = Challoc::new();
/// let layout = Layout::array::<u64>(25).unwrap();
///
/// unsafe {
///     let address = challoc.alloc(layout);
///     assert!(!address.is_null());
///     assert_eq!(address as usize % 16, 0);
///     challoc.dealloc(address, layout);
/// }
/// ```
///
/// ## Global allocator
///
/// ```no_run
/// use challoc::Challoc;
///
/// #[global_allocator]
/// static ALLOCATOR: Challoc = Challoc::new();
///
/// fn main() {
///     let flavors = vec!["plain", "poppy", "sesame"];
///     assert_eq!(flavors.len(), 3);
/// }
/// ```
pub struct Challoc {
    inner: Mutex<ChunkAllocator>,
}

impl Challoc {
    /// Builds the facade around a fresh [`ChunkAllocator`]. Usable in
    /// statics.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(ChunkAllocator::new()),
        }
    }
}

impl Default for Challoc {
    fn default() -> Self {
        Self::new()
    }
}

// The raw pointers inside make the engine !Send; the mutex is the only way
// in, so handing references across threads is fine.
unsafe impl Sync for Challoc {}

unsafe impl GlobalAlloc for Challoc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // 16 bytes is all the engine guarantees; stricter layouts are
        // refused rather than served misaligned.
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }

        match self.inner.lock() {
            Ok(mut allocator) => allocator.alloc(layout.size()),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Ok(mut allocator) = self.inner.lock() {
            allocator.dealloc(ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::OVERHEAD,
        chunk::{PAGE_OVERHEAD, TERMINATOR},
    };

    /// Snapshot of one chunk's interior: `(size, allocated)` per block,
    /// sentinel to terminator.
    #[derive(Debug, PartialEq)]
    struct ChunkMap {
        blocks: Vec<(usize, bool)>,
    }

    /// Walks left from any interior block to the start of its chunk, then
    /// right across the whole interior, checking every structural invariant
    /// on the way: matching tags, aligned legal sizes, no adjacent free
    /// blocks, and free list membership exactly when the allocated bit is
    /// clear. Reaching the terminator proves the blocks tile the interior.
    unsafe fn map_chunk(allocator: &ChunkAllocator, start: BlockPtr) -> ChunkMap {
        let mut first = start;
        while first.prev().size() != OVERHEAD {
            first = first.prev();
        }

        let mut blocks = Vec::new();
        let mut current = first;
        let mut previous_free = false;

        while current.header() != TERMINATOR {
            assert_eq!(current.header(), current.footer(), "tag mismatch");
            assert_eq!(current.size() % ALIGNMENT, 0, "unaligned block size");
            assert!(current.size() >= MIN_BLOCK_SIZE, "undersized block");
            assert_eq!(current.payload().as_ptr() as usize % ALIGNMENT, 0);

            let free = !current.is_allocated();
            assert!(!(free && previous_free), "adjacent free blocks");

            let listed = allocator.free.blocks().filter(|b| *b == current).count();
            assert_eq!(listed, free as usize, "free list membership");

            blocks.push((current.size(), current.is_allocated()));
            previous_free = free;
            current = current.next();
        }

        ChunkMap { blocks }
    }

    unsafe fn block_of(payload: *mut u8) -> BlockPtr {
        BlockPtr::from_payload(NonNull::new_unchecked(payload))
    }

    fn free_sizes(allocator: &ChunkAllocator) -> Vec<usize> {
        allocator
            .free
            .blocks()
            .map(|block| unsafe { block.size() })
            .collect()
    }

    fn free_len(allocator: &ChunkAllocator) -> usize {
        allocator.free.blocks().count()
    }

    #[test]
    fn single_allocation_round_trip() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            let p = allocator.alloc(16);
            assert!(!p.is_null());
            assert_eq!(p as usize % ALIGNMENT, 0);
            assert_eq!(allocator.chunk_count(), 1);
            map_chunk(&allocator, block_of(p));

            allocator.dealloc(p);

            // the chunk stays warm and its whole interior is free again
            assert_eq!(allocator.chunk_count(), 1);
            assert_eq!(free_len(&allocator), 1);
            assert_eq!(free_sizes(&allocator), vec![allocator.page_size - PAGE_OVERHEAD]);

            allocator.purge();
            assert_eq!(allocator.chunk_count(), 0);
        }
    }

    #[test]
    fn freeing_between_live_neighbors_does_not_coalesce() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            let a = allocator.alloc(16);
            let b = allocator.alloc(16);
            let c = allocator.alloc(16);

            allocator.dealloc(b);

            // b's block reappears alone at its own size, pinned between a
            // and c
            assert_eq!(free_len(&allocator), 2);
            assert!(free_sizes(&allocator).contains(&MIN_BLOCK_SIZE));

            let map = map_chunk(&allocator, block_of(a));
            assert_eq!(map.blocks[0], (MIN_BLOCK_SIZE, true));
            assert_eq!(map.blocks[1], (MIN_BLOCK_SIZE, false));
            assert_eq!(map.blocks[2], (MIN_BLOCK_SIZE, true));

            allocator.dealloc(a);
            allocator.dealloc(c);
            allocator.purge();
        }
    }

    #[test]
    fn freed_neighbors_merge_leftward() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            let a = allocator.alloc(16);
            let b = allocator.alloc(16);
            let c = allocator.alloc(16);

            allocator.dealloc(a);
            assert_eq!(free_len(&allocator), 2);

            allocator.dealloc(b);

            // b disappeared into a: still two free blocks, one twice the
            // size, listed under a's address
            assert_eq!(free_len(&allocator), 2);
            assert!(free_sizes(&allocator).contains(&(2 * MIN_BLOCK_SIZE)));
            assert!(allocator
                .free
                .blocks()
                .any(|block| block.payload().as_ptr() == a));

            let map = map_chunk(&allocator, block_of(c));
            assert_eq!(map.blocks[0], (2 * MIN_BLOCK_SIZE, false));
            assert_eq!(map.blocks[1], (MIN_BLOCK_SIZE, true));

            allocator.dealloc(c);
            allocator.purge();
        }
    }

    #[test]
    fn freed_neighbors_merge_rightward() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            let a = allocator.alloc(16);
            let b = allocator.alloc(16);
            let c = allocator.alloc(16);

            allocator.dealloc(b);
            allocator.dealloc(a);

            // a swallowed b and took over its list spot
            assert_eq!(free_len(&allocator), 2);
            let merged = allocator
                .free
                .blocks()
                .find(|block| block.payload().as_ptr() == a)
                .unwrap();
            assert_eq!(merged.size(), 2 * MIN_BLOCK_SIZE);

            allocator.dealloc(c);
            allocator.purge();
        }
    }

    #[test]
    fn large_chunk_returns_to_the_os() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            // a small allocation keeps the first chunk busy
            let keeper = allocator.alloc(16);
            let page_size = allocator.page_size;

            let big = allocator.alloc(page_size * 10);
            assert!(!big.is_null());
            assert_eq!(allocator.chunk_count(), 2);

            allocator.dealloc(big);

            // the big chunk emptied out and went back to the OS
            assert_eq!(allocator.chunk_count(), 1);

            allocator.dealloc(keeper);

            // the last chunk never does
            assert_eq!(allocator.chunk_count(), 1);
            assert_eq!(free_len(&allocator), 1);

            allocator.purge();
        }
    }

    #[test]
    fn the_last_chunk_stays_warm() {
        unsafe {
            let mut allocator = ChunkAllocator::new();
            let page_size = allocator.page_size();

            let big = allocator.alloc(page_size * 10);
            assert_eq!(allocator.chunk_count(), 1);

            allocator.dealloc(big);

            // sole chunk, fully idle, still mapped
            assert_eq!(allocator.chunk_count(), 1);
            assert_eq!(free_len(&allocator), 1);

            allocator.purge();
            assert_eq!(allocator.chunk_count(), 0);
            assert_eq!(free_len(&allocator), 0);
        }
    }

    #[test]
    fn map_multiplier_doubles_and_saturates() {
        unsafe {
            let mut allocator = ChunkAllocator::new();
            let page_size = allocator.page_size();

            // page-sized requests force fresh mappings early and often
            let count = if cfg!(miri) { 24 } else { 64 };
            let mut live = Vec::new();
            for _ in 0..count {
                let p = allocator.alloc(page_size);
                assert!(!p.is_null());
                live.push(p);
            }

            assert_eq!(allocator.map_multiplier, MAX_PAGE_PER_MAP);
            // geometric growth keeps mappings far below allocations
            assert!(allocator.chunk_count() <= 8);

            for p in live {
                allocator.dealloc(p);
            }

            // emptied chunks were unmapped down to the warm one, and the
            // multiplier never backed off
            assert_eq!(allocator.chunk_count(), 1);
            assert_eq!(allocator.map_multiplier, MAX_PAGE_PER_MAP);

            allocator.purge();
        }
    }

    #[test]
    fn absurd_requests_fail_cleanly() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            // size math overflow
            assert!(allocator.alloc(usize::MAX).is_null());
            assert!(allocator.alloc(usize::MAX - OVERHEAD).is_null());
            // pager refusal
            assert!(allocator.alloc(usize::MAX / 2).is_null());

            // the allocator still works afterwards
            let p = allocator.alloc(16);
            assert!(!p.is_null());
            allocator.dealloc(p);
            allocator.purge();
        }
    }

    #[test]
    fn round_trip_restores_the_free_list() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            // warm the arena first
            let warm = allocator.alloc(64);
            allocator.dealloc(warm);

            let before = free_sizes(&allocator);
            let p = allocator.alloc(64);
            allocator.dealloc(p);

            assert_eq!(free_sizes(&allocator), before);

            allocator.purge();
        }
    }

    #[test]
    fn mixed_workload_keeps_invariants() {
        unsafe {
            let mut allocator = ChunkAllocator::new();

            let sizes = [16, 24, 48, 160, 512, 1024, 96, 368];
            let count = if cfg!(miri) { 16 } else { 50 };

            let mut live = Vec::new();
            for (i, size) in sizes.iter().cycle().take(count).enumerate() {
                let p = allocator.alloc(*size);
                assert!(!p.is_null());
                let fill = (i % 251) as u8;
                p.write_bytes(fill, *size);
                live.push((p, *size, fill));
            }

            // nothing stomped on anything else
            for (p, size, fill) in &live {
                for offset in 0..*size {
                    assert_eq!(p.add(offset).read(), *fill);
                }
            }

            map_chunk(&allocator, block_of(live[0].0));

            // free every other one, then the rest
            for (p, _, _) in live.iter().step_by(2) {
                allocator.dealloc(*p);
            }
            for (p, _, _) in live.iter().skip(1).step_by(2) {
                allocator.dealloc(*p);
            }

            assert_eq!(allocator.chunk_count(), 1);
            assert_eq!(free_len(&allocator), 1);

            allocator.purge();
            assert_eq!(allocator.chunk_count(), 0);
        }
    }

    #[test]
    fn global_alloc_facade() {
        let challoc = Challoc::new();

        unsafe {
            let layout = Layout::from_size_align(256, 16).unwrap();
            let address = challoc.alloc(layout);
            assert!(!address.is_null());

            address.write_bytes(0xAB, layout.size());
            assert_eq!(address.read(), 0xAB);
            challoc.dealloc(address, layout);

            // stricter alignment than the engine provides is refused
            let overaligned = Layout::from_size_align(64, 32).unwrap();
            assert!(challoc.alloc(overaligned).is_null());

            challoc.inner.lock().unwrap().purge();
        }
    }

    #[test]
    fn facade_survives_thread_contention() {
        let challoc = Challoc::new();
        let threads = 4;
        let rounds = if cfg!(miri) { 10 } else { 200 };

        std::thread::scope(|scope| {
            for t in 0..threads {
                let challoc = &challoc;
                scope.spawn(move || unsafe {
                    let layout = Layout::from_size_align(64 + t * 32, 8).unwrap();
                    for _ in 0..rounds {
                        let address = challoc.alloc(layout);
                        assert!(!address.is_null());

                        address.write_bytes(t as u8, layout.size());
                        for offset in 0..layout.size() {
                            assert_eq!(address.add(offset).read(), t as u8);
                        }

                        challoc.dealloc(address, layout);
                    }
                });
            }
        });

        unsafe {
            let mut allocator = challoc.inner.lock().unwrap();
            allocator.purge();
            assert_eq!(allocator.chunk_count(), 0);
        }
    }
}
