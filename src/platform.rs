use std::ptr::NonNull;

use crate::Pointer;

/// The pager: the OS-specific primitive everything above sits on. Only
/// three operations are needed (map fresh pages, hand them back, report the
/// page size), so all platform flavor stays behind this trait.
trait PlatformPager {
    /// Maps `length` bytes of zeroed, readable and writable memory.
    /// `length` must be a multiple of [`PlatformPager::page_size`]; the
    /// mapping is page-aligned and disjoint from every live mapping.
    unsafe fn map_pages(length: usize) -> Pointer<u8>;

    /// Returns a mapping to the OS. `base` and `length` must exactly match
    /// a live mapping produced by [`PlatformPager::map_pages`].
    unsafe fn unmap_pages(base: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes, a power of two.
    fn page_size() -> usize;
}

/// Zero sized type carrying the [`PlatformPager`] impl for the current
/// target.
struct Pager;

/// See [`PlatformPager::map_pages`].
#[inline]
pub(crate) unsafe fn map_pages(length: usize) -> Pointer<u8> {
    Pager::map_pages(length)
}

/// See [`PlatformPager::unmap_pages`].
#[inline]
pub(crate) unsafe fn unmap_pages(base: NonNull<u8>, length: usize) {
    Pager::unmap_pages(base, length)
}

/// See [`PlatformPager::page_size`].
#[inline]
pub(crate) fn page_size() -> usize {
    Pager::page_size()
}

#[cfg(unix)]
#[cfg(not(miri))]
mod unix {
    use std::ptr::{self, NonNull};

    use super::{Pager, PlatformPager};
    use crate::Pointer;

    impl PlatformPager for Pager {
        unsafe fn map_pages(length: usize) -> Pointer<u8> {
            let protection = libc::PROT_READ | libc::PROT_WRITE;
            // Private to this process and not backed by any file; anonymous
            // mappings come back zeroed.
            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

            let address = libc::mmap(ptr::null_mut(), length, protection, flags, -1, 0);
            if address == libc::MAP_FAILED {
                return None;
            }

            Some(NonNull::new_unchecked(address).cast())
        }

        unsafe fn unmap_pages(base: NonNull<u8>, length: usize) {
            // munmap only fails on arguments we never produce.
            let result = libc::munmap(base.cast().as_ptr(), length);
            debug_assert_eq!(result, 0);
        }

        fn page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }
}

#[cfg(windows)]
#[cfg(not(miri))]
mod win {
    use std::{mem::MaybeUninit, ptr::NonNull};

    use windows::Win32::System::{Memory, SystemInformation};

    use super::{Pager, PlatformPager};
    use crate::Pointer;

    impl PlatformPager for Pager {
        unsafe fn map_pages(length: usize) -> Pointer<u8> {
            let protection = Memory::PAGE_READWRITE;
            // Reserve and commit in one call; committed pages come back
            // zeroed just like anonymous mmap.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            let address = Memory::VirtualAlloc(None, length, flags, protection);

            NonNull::new(address.cast())
        }

        unsafe fn unmap_pages(base: NonNull<u8>, _length: usize) {
            // MEM_RELEASE frees the whole reservation and requires a zero
            // length.
            let freed = Memory::VirtualFree(base.cast().as_ptr(), 0, Memory::MEM_RELEASE);
            debug_assert!(freed.as_bool());
        }

        fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            unsafe { SystemInformation::GetSystemInfo(system_info.as_mut_ptr()) };

            unsafe { system_info.assume_init() }.dwPageSize as usize
        }
    }
}

#[cfg(miri)]
mod miri {
    //! Miri has no FFI, so pages are faked through the global allocator
    //! with page-size alignment. As a bonus, any chunk the allocator
    //! forgets to unmap shows up in Miri's leak report.

    use std::{alloc, ptr::NonNull};

    use super::{Pager, PlatformPager};
    use crate::Pointer;

    const PAGE_SIZE: usize = 4096;

    impl PlatformPager for Pager {
        unsafe fn map_pages(length: usize) -> Pointer<u8> {
            let layout = alloc::Layout::from_size_align(length, PAGE_SIZE).ok()?;
            NonNull::new(alloc::alloc_zeroed(layout))
        }

        unsafe fn unmap_pages(base: NonNull<u8>, length: usize) {
            let layout = alloc::Layout::from_size_align(length, PAGE_SIZE).unwrap();
            alloc::dealloc(base.as_ptr(), layout);
        }

        fn page_size() -> usize {
            PAGE_SIZE
        }
    }
}
