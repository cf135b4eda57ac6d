//! Ring header layout and the cursor reservation/publication protocol.
//!
//! # Memory Ordering
//!
//! Each side of the ring owns a [`HeadTail`] cursor block. `head` counts
//! reservations issued on that side, `tail` counts completions published.
//! Both are free-running 32-bit counters; every distance between them is a
//! wrapping subtraction, well-defined because the reservation bound keeps
//! occupancy at or below `size`.
//!
//! The protocol needs exactly three ordering edges:
//!
//! 1. `move_head` loads its own `head`, then the opposite `tail` with
//!    `Acquire` (behind an `Acquire` fence that pins the load order).
//!    Acquiring the producer's `tail` makes the published slot contents
//!    visible to a consumer; acquiring the consumer's `tail` makes the
//!    drained slots safe for a producer to overwrite.
//! 2. Slot copies happen strictly between reservation and publication;
//!    the claim grants exclusive access to that index range.
//! 3. `publish` stores the new `tail` with `Release`, ordering the slot
//!    copies before the store. In shared mode it first spins until
//!    `tail` reaches the claim's start, loading with `Acquire`: an earlier
//!    reserver's release store is observed there, so its slot writes are
//!    ordered before ours and a single acquire on the final `tail` value
//!    covers the whole prefix.
//!
//! The spin in step 3 is the only wait in the protocol. It is bounded by
//! the forward progress of earlier reservers on the same side.

use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::util::CACHE_LINE_SIZE;

use super::Flags;

/// One side's cursor block. Padded to a full cache line so the producer
/// and consumer blocks never share one.
#[repr(C, align(64))]
pub(crate) struct HeadTail {
    /// Reservations issued on this side.
    pub(crate) head: AtomicU32,
    /// Completions published on this side. Never ahead of `head`.
    pub(crate) tail: AtomicU32,
    /// Exclusive mode: at most one thread drives this side.
    pub(crate) single: bool,
}

impl HeadTail {
    fn new(single: bool) -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            single,
        }
    }

    /// Publishes a claimed range by advancing `tail` past it.
    ///
    /// Publication retires strictly in reservation order: a claim may only
    /// land once `tail` has caught up to its start.
    #[inline]
    pub(crate) fn publish<const SINGLE: bool>(&self, claim: Claim) {
        if SINGLE {
            debug_assert_eq!(self.tail.load(Ordering::Relaxed), claim.start);
        } else {
            // Pairs with the Release below as performed by the claim's
            // predecessor, so the predecessor's slot writes are ordered
            // before ours.
            while self.tail.load(Ordering::Acquire) != claim.start {
                std::hint::spin_loop();
            }
        }
        self.tail
            .store(claim.start.wrapping_add(claim.len), Ordering::Release);
    }
}

/// A reserved range of slots: `len` entries starting at cursor `start`.
///
/// `len == 0` means the reservation found nothing to do; no slots may be
/// touched and nothing is published.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Claim {
    pub(crate) start: u32,
    pub(crate) len: u32,
}

/// Ring header: construction-time constants plus the two cursor blocks.
///
/// Payload slots follow this header in the same allocation, starting at
/// `size_of::<RawRing>()`, which the layout assertions below keep
/// cache-line aligned.
#[repr(C)]
pub(crate) struct RawRing {
    pub(crate) flags: Flags,
    /// Slot count of the backing array; always a power of two.
    pub(crate) size: u32,
    /// `size - 1`, used for index wrap.
    pub(crate) mask: u32,
    /// Maximum simultaneous occupancy; `<= mask`.
    pub(crate) capacity: u32,
    pub(crate) prod: HeadTail,
    pub(crate) cons: HeadTail,
}

const _: () = {
    assert!(size_of::<HeadTail>() == CACHE_LINE_SIZE);
    assert!(size_of::<RawRing>() % CACHE_LINE_SIZE == 0);
    assert!(core::mem::offset_of!(RawRing, prod) % CACHE_LINE_SIZE == 0);
    assert!(core::mem::offset_of!(RawRing, cons) % CACHE_LINE_SIZE == 0);
    assert!(
        core::mem::offset_of!(RawRing, cons) - core::mem::offset_of!(RawRing, prod)
            >= CACHE_LINE_SIZE
    );
};

impl RawRing {
    /// Writes a fresh header into `ptr`.
    ///
    /// `size` must be a power of two and `capacity < size`; the caller has
    /// already validated both.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    ///
    /// - `ptr` is non-null, aligned to [`CACHE_LINE_SIZE`], and writable
    ///   for `size_of::<RawRing>()` bytes
    /// - no other reference to the memory exists during initialisation
    pub(crate) unsafe fn init(ptr: *mut Self, flags: Flags, size: u32, capacity: u32) {
        debug_assert!(size.is_power_of_two());
        debug_assert!(capacity < size);
        // SAFETY: caller guarantees ptr is valid, aligned and exclusive.
        // Field-by-field writes avoid creating a reference to memory that
        // has not been initialised yet.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).flags).write(flags);
            std::ptr::addr_of_mut!((*ptr).size).write(size);
            std::ptr::addr_of_mut!((*ptr).mask).write(size - 1);
            std::ptr::addr_of_mut!((*ptr).capacity).write(capacity);
            std::ptr::addr_of_mut!((*ptr).prod).write(HeadTail::new(flags.contains(Flags::SP_ENQ)));
            std::ptr::addr_of_mut!((*ptr).cons).write(HeadTail::new(flags.contains(Flags::SC_DEQ)));
        }
    }

    /// Reserves up to `n` slots on one side by advancing its `head`.
    ///
    /// `PROD` selects the producer side (reserving free slots) or the
    /// consumer side (reserving occupied slots). `SINGLE` collapses the
    /// CAS loop to a plain store. `FIXED` makes the reservation
    /// all-or-nothing instead of partial.
    ///
    /// The returned claim has `len == 0` when nothing could be reserved.
    /// With `SINGLE` the caller must be the only thread driving that side.
    #[inline]
    pub(crate) fn move_head<const PROD: bool, const SINGLE: bool, const FIXED: bool>(
        &self,
        n: u32,
    ) -> Claim {
        let (own, other) = if PROD {
            (&self.prod, &self.cons)
        } else {
            (&self.cons, &self.prod)
        };

        let mut start = own.head.load(Ordering::Relaxed);
        loop {
            // Own head must be read before the opposite tail; the fence
            // keeps the pair ordered across CAS retries as well.
            fence(Ordering::Acquire);
            let opposite_tail = other.tail.load(Ordering::Acquire);

            // Free slots for a producer, occupied entries for a consumer.
            // Wrapping 32-bit distances stay unambiguous because occupancy
            // never exceeds `capacity < 2^31`.
            let available = if PROD {
                self.capacity
                    .wrapping_sub(start.wrapping_sub(opposite_tail))
            } else {
                opposite_tail.wrapping_sub(start)
            };

            let len = if FIXED {
                if available < n { 0 } else { n }
            } else {
                n.min(available)
            };
            if len == 0 {
                return Claim { start, len: 0 };
            }

            let new_head = start.wrapping_add(len);
            if SINGLE {
                own.head.store(new_head, Ordering::Relaxed);
                return Claim { start, len };
            }
            match own
                .head
                .compare_exchange_weak(start, new_head, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return Claim { start, len },
                Err(current) => start = current,
            }
        }
    }

    /// Entries currently in the ring, clamped to `capacity`.
    ///
    /// A snapshot; immediately stale under concurrency.
    #[inline]
    pub(crate) fn count(&self) -> u32 {
        let prod_tail = self.prod.tail.load(Ordering::Acquire);
        let cons_tail = self.cons.tail.load(Ordering::Acquire);
        let count = prod_tail.wrapping_sub(cons_tail) & self.mask;
        count.min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn test_cursor_blocks_are_cache_line_isolated() {
        assert_eq!(align_of::<HeadTail>(), CACHE_LINE_SIZE);
        assert_eq!(size_of::<HeadTail>(), CACHE_LINE_SIZE);
        assert_eq!(offset_of!(RawRing, prod) % CACHE_LINE_SIZE, 0);
        assert_eq!(offset_of!(RawRing, cons) % CACHE_LINE_SIZE, 0);
        assert_ne!(
            offset_of!(RawRing, prod) / CACHE_LINE_SIZE,
            offset_of!(RawRing, cons) / CACHE_LINE_SIZE
        );
    }

    #[test]
    fn test_header_is_cache_line_multiple() {
        assert_eq!(size_of::<RawRing>() % CACHE_LINE_SIZE, 0);
        // flags/size/mask/capacity share the first line, one line per
        // cursor block after that.
        assert_eq!(size_of::<RawRing>(), 3 * CACHE_LINE_SIZE);
    }
}
