//! Memory backing for rings.
//!
//! A ring is one contiguous allocation: header first, payload slots after.
//! Where that allocation comes from is the embedder's business, so the ring
//! constructors take a [`RingAllocator`] hook:
//!
//! - [`Heap`] - the process allocator (`std::alloc`), the default
//! - [`Mmap`] - anonymous page mappings, for rings that should live on
//!   their own pages away from the general heap
//! - [`Extern`] - no allocator at all; the embedder hands in memory it
//!   owns (for example a shared mapping it arranged itself) and reclaims
//!   it after the ring handle is gone

use std::alloc::Layout;
use std::ptr::NonNull;

use rustix::mm::{MapFlags, ProtFlags, mmap_anonymous, munmap};

/// Allocation hook used by ring construction.
///
/// # Safety
///
/// Implementors must return memory that is zero-filled, aligned to
/// `layout.align()`, valid for reads and writes of `layout.size()` bytes,
/// and not aliased by any other live allocation. `dealloc` must accept
/// exactly the pointer/layout pair a prior `alloc_zeroed` produced.
pub unsafe trait RingAllocator {
    /// Allocates a zeroed region for `layout`, or `None` on exhaustion.
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Releases a region previously returned by [`alloc_zeroed`](Self::alloc_zeroed).
    ///
    /// # Safety
    ///
    /// `ptr` and `layout` must match a live allocation from this allocator,
    /// and no reference into the region may outlive this call.
    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The process heap (`std::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct Heap;

// SAFETY: std::alloc::alloc_zeroed returns zeroed, layout-aligned, exclusive
// memory; dealloc with the identical layout is the matching release.
unsafe impl RingAllocator for Heap {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: ring layouts are never zero-sized (the header alone is
        // several cache lines).
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr)
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller passes the pointer/layout pair from alloc_zeroed.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

/// Anonymous private page mappings.
///
/// Pages arrive zeroed from the kernel and are naturally aligned well past
/// any cache-line requirement. Useful when a large ring should not churn
/// the general-purpose heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct Mmap;

/// Smallest page size on supported targets; mapping alignment is at least
/// this, so any layout alignment up to it is satisfied for free.
const PAGE_SIZE: usize = 4096;

// SAFETY: mmap_anonymous returns zero-filled, page-aligned, exclusive
// mappings; munmap over the same range is the matching release.
unsafe impl RingAllocator for Mmap {
    fn alloc_zeroed(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() > PAGE_SIZE {
            return None;
        }
        // SAFETY: null hint + PRIVATE anonymous mapping has no aliasing or
        // file-offset preconditions; the kernel picks the address.
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                layout.size(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        }
        .ok()?;
        NonNull::new(ptr.cast())
    }

    unsafe fn dealloc(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller passes the pointer/length pair from alloc_zeroed;
        // munmap releases whole pages covering the range.
        let _ = unsafe { munmap(ptr.as_ptr().cast(), layout.size()) };
    }
}

/// Embedder-owned memory; the ring neither allocates nor frees.
///
/// Used by in-place initialisation over memory the caller arranged
/// (static buffers, shared mappings). Asking it to allocate always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct Extern;

// SAFETY: never hands out memory, never touches memory on dealloc.
unsafe impl RingAllocator for Extern {
    fn alloc_zeroed(&self, _layout: Layout) -> Option<NonNull<u8>> {
        None
    }

    unsafe fn dealloc(&self, _ptr: NonNull<u8>, _layout: Layout) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<A: RingAllocator>(alloc: &A) {
        let layout = Layout::from_size_align(1024, 64).unwrap();
        let ptr = alloc.alloc_zeroed(layout).expect("allocation failed");
        assert_eq!(ptr.as_ptr() as usize % 64, 0);

        // SAFETY: freshly allocated, exclusive, 1024 bytes.
        let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), 1024) };
        assert!(bytes.iter().all(|&b| b == 0));
        bytes[0] = 0xAB;
        bytes[1023] = 0xCD;

        // SAFETY: same pointer/layout pair, no references remain.
        unsafe { alloc.dealloc(ptr, layout) };
    }

    #[test]
    fn test_heap_roundtrip() {
        roundtrip(&Heap);
    }

    #[test]
    fn test_mmap_roundtrip() {
        roundtrip(&Mmap);
    }

    #[test]
    fn test_mmap_rejects_oversized_alignment() {
        let layout = Layout::from_size_align(1024, 2 * PAGE_SIZE).unwrap();
        assert!(Mmap.alloc_zeroed(layout).is_none());
    }

    #[test]
    fn test_extern_never_allocates() {
        let layout = Layout::from_size_align(64, 64).unwrap();
        assert!(Extern.alloc_zeroed(layout).is_none());
    }
}
