//! Bounded lock-free FIFO ring for bit-copyable payload handles.
//!
//! # Overview
//!
//! - [`Ring`] - one contiguous allocation holding a header and a
//!   power-of-two array of payload slots
//! - Producer and consumer sides are independently *exclusive* (one
//!   thread) or *shared* (any number of threads), chosen by [`Flags`] at
//!   construction
//! - *Bulk* transfers move exactly `n` entries or none; *burst* transfers
//!   move as many as fit, up to `n`
//! - Lock-free: reservations go through a CAS loop, publication is an
//!   ordered spin on the reserving predecessors, and nothing ever waits
//!   on the OS
//!
//! Transfers never fail: a bulk call that cannot complete returns 0, a
//! burst call returns the partial count. Callers check the returned count,
//! not an error.
//!
//! # Example
//!
//! ```
//! use rotor::{Flags, Ring};
//!
//! let ring = Ring::<u64>::new(8, Flags::SP_ENQ | Flags::SC_DEQ)?;
//! assert_eq!(ring.capacity(), 7);
//!
//! assert_eq!(ring.enqueue_burst(&[1, 2, 3]), 3);
//! let mut out = [0u64; 8];
//! assert_eq!(ring.dequeue_burst(&mut out), 3);
//! assert_eq!(&out[..3], &[1, 2, 3]);
//! # Ok::<(), rotor::RingError>(())
//! ```
//!
//! # FIFO
//!
//! Entries leave in the order their slots were *reserved*, not in the
//! order concurrent producers happened to finish writing. Restricted to
//! any one producer's items, a consumer always observes that producer's
//! enqueue order.
//!
//! # Exclusive-mode contract
//!
//! [`Flags::SP_ENQ`] and [`Flags::SC_DEQ`] are a promise from the
//! embedder: at most one thread drives that side, ever. The promise buys
//! the plain-store reservation path. The type system cannot check a
//! promise about *other* threads, so breaking it is undefined behavior,
//! exactly as if the unsafe [`sp_enqueue_bulk`](Ring::sp_enqueue_bulk)
//! family had been misused. Rings built without these flags are safe for
//! any number of threads on either side.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::BitOr;
use std::ptr::NonNull;

use thiserror::Error;

use crate::mem::{Extern, Heap, RingAllocator};
use crate::trace;
use crate::util::{CACHE_LINE_SIZE, align32_pow2, align_up, is_power_of_two};

pub(crate) mod raw;

use raw::RawRing;

/// Largest requested count accepted at construction.
///
/// Kept below `2^31` so 32-bit cursor distances stay unambiguous; the
/// backing storage itself may round up to `2^31` slots in exact-size mode.
pub const MAX_CAPACITY: u32 = 0x7fff_ffff;

/// Construction flags.
///
/// The default (empty) value selects the shared path on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Flags(u32);

impl Flags {
    /// Producer side is exclusive: at most one thread enqueues.
    pub const SP_ENQ: Flags = Flags(1 << 0);
    /// Consumer side is exclusive: at most one thread dequeues.
    pub const SC_DEQ: Flags = Flags(1 << 1);
    /// Treat the requested count as the exact usable capacity and round
    /// the backing storage up to the next power of two internally.
    pub const EXACT_SZ: Flags = Flags(1 << 2);

    /// No flags: shared producer, shared consumer, power-of-two count.
    #[must_use]
    pub const fn empty() -> Self {
        Flags(0)
    }

    /// Returns `true` if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// The raw flag bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

/// Construction-time failures. Transfers never produce these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    /// Requested count is not a power of two in `2..=MAX_CAPACITY`.
    #[error("ring size {0} is invalid: must be a power of two in 2..={MAX_CAPACITY}")]
    InvalidSize(u32),
    /// Exact-size count is outside `1..=MAX_CAPACITY`.
    #[error("ring capacity {0} is invalid: must be in 1..={MAX_CAPACITY}")]
    InvalidCapacity(u32),
    /// The allocator could not provide the backing storage.
    #[error("cannot reserve {0} bytes of ring storage")]
    AllocFailed(usize),
}

/// Validates a requested count and resolves it to `(size, capacity)`.
fn resolve_count(count: u32, flags: Flags) -> Result<(u32, u32), RingError> {
    if flags.contains(Flags::EXACT_SZ) {
        if count == 0 || count > MAX_CAPACITY {
            trace::error!("exact ring capacity {count} is out of range (1..={MAX_CAPACITY})");
            return Err(RingError::InvalidCapacity(count));
        }
        // count + 1 keeps one slot in reserve so full and empty stay
        // distinguishable; the rounded size never exceeds 2^31.
        Ok((align32_pow2(count + 1), count))
    } else {
        if !is_power_of_two(count) || count < 2 || count > MAX_CAPACITY {
            trace::error!(
                "ring size {count} is invalid: must be a power of two in 2..={MAX_CAPACITY}"
            );
            return Err(RingError::InvalidSize(count));
        }
        Ok((count, count - 1))
    }
}

/// A bounded lock-free MPMC FIFO ring.
///
/// `T` is the payload handle type: plain bit-copyable data, typically
/// pointer-width (an index, a token, a raw pointer). The ring copies
/// handles in and out and never looks inside them.
///
/// `A` is the [`RingAllocator`] that owns the backing storage; [`Heap`]
/// by default.
///
/// The ring itself is [`Sync`]: one `Ring` value (behind an `Arc` or a
/// reference) is shared by every producer and consumer thread. See the
/// [module docs](self) for the exclusive-mode contract attached to
/// [`Flags::SP_ENQ`] / [`Flags::SC_DEQ`].
pub struct Ring<T, A: RingAllocator = Heap> {
    raw: NonNull<RawRing>,
    slots: NonNull<T>,
    bytes: usize,
    alloc: A,
    _owns: PhantomData<T>,
}

// SAFETY: the ring owns its allocation and hands out T by copy; sending
// the handle moves plain data plus the allocator.
unsafe impl<T: Send, A: RingAllocator + Send> Send for Ring<T, A> {}

// SAFETY: all shared mutation goes through the atomic cursor protocol;
// slot access is serialised by reservation claims.
unsafe impl<T: Send, A: RingAllocator + Sync> Sync for Ring<T, A> {}

impl<T: Copy> Ring<T, Heap> {
    /// Creates a ring with `count` slots on the process heap.
    ///
    /// Without [`Flags::EXACT_SZ`], `count` must be a power of two and the
    /// usable capacity is `count - 1`. With it, `count` may be any value
    /// in `1..=`[`MAX_CAPACITY`] and is the exact usable capacity.
    ///
    /// # Errors
    ///
    /// [`RingError::InvalidSize`] / [`RingError::InvalidCapacity`] for a
    /// bad `count`, [`RingError::AllocFailed`] when the allocator is
    /// exhausted.
    pub fn new(count: u32, flags: Flags) -> Result<Self, RingError> {
        Self::new_in(count, flags, Heap)
    }
}

impl<T: Copy> Ring<T, Extern> {
    /// Initialises a ring in caller-provided memory.
    ///
    /// The handle operates on the memory but does not own it: dropping the
    /// ring releases nothing. This is the building block for rings placed
    /// in mappings the embedder arranged (static buffers, shared memory).
    ///
    /// # Errors
    ///
    /// Same count validation as [`Ring::new`].
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    ///
    /// - `mem` is aligned to a cache line and valid for reads and writes
    ///   of [`Ring::memsize`]`(count)` bytes (after exact-size rounding)
    /// - no other reference to the region exists during initialisation
    /// - the region stays valid and unmoved for the life of the handle
    pub unsafe fn init_at(mem: NonNull<u8>, count: u32, flags: Flags) -> Result<Self, RingError> {
        let () = Self::PAYLOAD_OK;
        let (size, capacity) = resolve_count(count, flags)?;
        // SAFETY: caller guarantees alignment, size and exclusivity.
        unsafe {
            RawRing::init(mem.cast().as_ptr(), flags, size, capacity);
            Ok(Self::from_parts(mem, Self::memsize_of(size), Extern))
        }
    }
}

impl<T: Copy, A: RingAllocator> Ring<T, A> {
    /// Compile-time assertion that `T` fits the slot layout.
    const PAYLOAD_OK: () = assert!(
        size_of::<T>() > 0 && align_of::<T>() <= CACHE_LINE_SIZE,
        "ring payloads must be sized and at most cache-line aligned"
    );

    /// Bytes of backing storage a ring with `count` slots occupies.
    ///
    /// The result covers header plus slots, rounded up to a whole number
    /// of cache lines.
    ///
    /// # Errors
    ///
    /// [`RingError::InvalidSize`] unless `count` is a power of two of at
    /// least 2. Exact-size construction rounds its count up before
    /// consulting this, so every size it produces is accepted here.
    pub fn memsize(count: u32) -> Result<usize, RingError> {
        if !is_power_of_two(count) || count < 2 {
            trace::error!("ring size {count} is invalid: must be a power of two of at least 2");
            return Err(RingError::InvalidSize(count));
        }
        Ok(Self::memsize_of(count))
    }

    const fn memsize_of(size: u32) -> usize {
        align_up(
            size_of::<RawRing>() + size as usize * size_of::<T>(),
            CACHE_LINE_SIZE,
        )
    }

    /// Creates a ring backed by an explicit allocator.
    ///
    /// See [`Ring::new`] for count validation.
    ///
    /// # Errors
    ///
    /// [`RingError::InvalidSize`] / [`RingError::InvalidCapacity`] for a
    /// bad `count`, [`RingError::AllocFailed`] when `alloc` cannot provide
    /// the storage.
    pub fn new_in(count: u32, flags: Flags, alloc: A) -> Result<Self, RingError> {
        let () = Self::PAYLOAD_OK;
        let (size, capacity) = resolve_count(count, flags)?;
        let bytes = Self::memsize_of(size);
        let Ok(layout) = Layout::from_size_align(bytes, CACHE_LINE_SIZE) else {
            trace::error!("ring storage of {bytes} bytes exceeds the address space");
            return Err(RingError::AllocFailed(bytes));
        };
        let Some(mem) = alloc.alloc_zeroed(layout) else {
            trace::error!("cannot reserve {bytes} bytes of ring storage");
            return Err(RingError::AllocFailed(bytes));
        };
        // SAFETY: fresh zeroed allocation, cache-line aligned, exclusive.
        unsafe { RawRing::init(mem.cast().as_ptr(), flags, size, capacity) };
        trace::debug!("ring created: size={size} capacity={capacity} bytes={bytes}");
        // SAFETY: mem now holds an initialised header with `size` slots
        // behind it, owned by `alloc`.
        Ok(unsafe { Self::from_parts(mem, bytes, alloc) })
    }

    /// # Safety
    ///
    /// `mem` must hold an initialised header followed by the slot array,
    /// sized and aligned per [`Ring::memsize`].
    unsafe fn from_parts(mem: NonNull<u8>, bytes: usize, alloc: A) -> Self {
        // SAFETY: slots start right after the header; the offset is a
        // multiple of the cache line, which bounds align_of::<T>().
        let slots = unsafe {
            NonNull::new_unchecked(mem.as_ptr().add(size_of::<RawRing>()).cast::<T>())
        };
        Self {
            raw: mem.cast(),
            slots,
            bytes,
            alloc,
            _owns: PhantomData,
        }
    }

    #[inline]
    fn raw(&self) -> &RawRing {
        // SAFETY: self.raw points at the initialised header for the life
        // of the handle.
        unsafe { self.raw.as_ref() }
    }

    // ---- transfer core ----------------------------------------------

    /// Copies `src` into the slots claimed at cursor `start`, splitting at
    /// the wrap point.
    ///
    /// # Safety
    ///
    /// Caller must hold an unpublished claim covering
    /// `[start, start + src.len())`.
    #[inline]
    unsafe fn copy_in(&self, start: u32, src: &[T]) {
        let size = self.raw().size as usize;
        let idx = (start & self.raw().mask) as usize;
        let n = src.len();
        let first = n.min(size - idx);
        let base = self.slots.as_ptr();
        // SAFETY: the claim makes [idx, idx + first) and [0, n - first)
        // exclusively ours; both segments are in bounds of the slot array.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(idx), first);
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, n - first);
        }
    }

    /// Copies `n` slots claimed at cursor `start` out to `dst`.
    ///
    /// # Safety
    ///
    /// Caller must hold an unpublished claim covering `[start, start + n)`
    /// and `dst` must be writable for `n` elements.
    #[inline]
    unsafe fn copy_out(&self, start: u32, dst: *mut T, n: u32) {
        let size = self.raw().size as usize;
        let idx = (start & self.raw().mask) as usize;
        let n = n as usize;
        let first = n.min(size - idx);
        let base = self.slots.as_ptr();
        // SAFETY: as in copy_in, with the transfer direction reversed.
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(idx), dst, first);
            std::ptr::copy_nonoverlapping(base, dst.add(first), n - first);
        }
    }

    /// # Safety
    ///
    /// With `SINGLE`, the caller must be the only thread enqueuing.
    #[inline]
    unsafe fn do_enqueue<const SINGLE: bool, const FIXED: bool>(&self, items: &[T]) -> u32 {
        let n = u32::try_from(items.len()).unwrap_or(u32::MAX);
        let claim = self.raw().move_head::<true, SINGLE, FIXED>(n);
        if claim.len == 0 {
            return 0;
        }
        // SAFETY: the claim grants exclusive write access to `len` slots
        // starting at `start`.
        unsafe { self.copy_in(claim.start, &items[..claim.len as usize]) };
        self.raw().prod.publish::<SINGLE>(claim);
        claim.len
    }

    /// # Safety
    ///
    /// With `SINGLE`, the caller must be the only thread dequeuing. `dst`
    /// must be writable for `n` elements.
    #[inline]
    unsafe fn do_dequeue<const SINGLE: bool, const FIXED: bool>(&self, dst: *mut T, n: u32) -> u32 {
        let claim = self.raw().move_head::<false, SINGLE, FIXED>(n);
        if claim.len == 0 {
            return 0;
        }
        // SAFETY: the claim grants exclusive read access to `len` occupied
        // slots starting at `start`; dst has room per the caller.
        unsafe { self.copy_out(claim.start, dst, claim.len) };
        self.raw().cons.publish::<SINGLE>(claim);
        claim.len
    }

    // ---- enqueue ----------------------------------------------------

    /// Enqueues all of `items`, or nothing.
    ///
    /// Returns `items.len()` on success, 0 when the ring lacks the free
    /// capacity. Dispatches on the producer mode chosen at construction.
    #[inline]
    pub fn enqueue_bulk(&self, items: &[T]) -> u32 {
        if self.raw().prod.single {
            // SAFETY: SP_ENQ carries the construction-time promise of a
            // single enqueuing thread (see the exclusive-mode contract).
            unsafe { self.do_enqueue::<true, true>(items) }
        } else {
            // SAFETY: the shared path has no exclusivity requirement.
            unsafe { self.do_enqueue::<false, true>(items) }
        }
    }

    /// Enqueues as many of `items` as fit; returns how many.
    #[inline]
    pub fn enqueue_burst(&self, items: &[T]) -> u32 {
        if self.raw().prod.single {
            // SAFETY: as in enqueue_bulk.
            unsafe { self.do_enqueue::<true, false>(items) }
        } else {
            // SAFETY: as in enqueue_bulk.
            unsafe { self.do_enqueue::<false, false>(items) }
        }
    }

    /// All-or-nothing enqueue over the shared (multi-producer) path,
    /// regardless of the construction flags.
    #[inline]
    pub fn mp_enqueue_bulk(&self, items: &[T]) -> u32 {
        // SAFETY: the shared path has no exclusivity requirement.
        unsafe { self.do_enqueue::<false, true>(items) }
    }

    /// Partial enqueue over the shared (multi-producer) path.
    #[inline]
    pub fn mp_enqueue_burst(&self, items: &[T]) -> u32 {
        // SAFETY: the shared path has no exclusivity requirement.
        unsafe { self.do_enqueue::<false, false>(items) }
    }

    /// All-or-nothing enqueue over the exclusive (single-producer) path.
    ///
    /// # Safety
    ///
    /// Caller must be the only thread enqueuing on this ring for the
    /// duration of the call.
    #[inline]
    pub unsafe fn sp_enqueue_bulk(&self, items: &[T]) -> u32 {
        // SAFETY: exclusivity is the caller's contract.
        unsafe { self.do_enqueue::<true, true>(items) }
    }

    /// Partial enqueue over the exclusive (single-producer) path.
    ///
    /// # Safety
    ///
    /// Caller must be the only thread enqueuing on this ring for the
    /// duration of the call.
    #[inline]
    pub unsafe fn sp_enqueue_burst(&self, items: &[T]) -> u32 {
        // SAFETY: exclusivity is the caller's contract.
        unsafe { self.do_enqueue::<true, false>(items) }
    }

    /// Enqueues one item; `Err(item)` hands it back if the ring is full.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        if self.enqueue_bulk(std::slice::from_ref(&item)) == 1 {
            Ok(())
        } else {
            Err(item)
        }
    }

    // ---- dequeue ----------------------------------------------------

    /// Fills all of `out`, or nothing.
    ///
    /// Returns `out.len()` on success, 0 when fewer entries are available.
    /// Dispatches on the consumer mode chosen at construction.
    #[inline]
    pub fn dequeue_bulk(&self, out: &mut [T]) -> u32 {
        let n = u32::try_from(out.len()).unwrap_or(u32::MAX);
        if self.raw().cons.single {
            // SAFETY: SC_DEQ carries the construction-time promise of a
            // single dequeuing thread; out is writable for n elements.
            unsafe { self.do_dequeue::<true, true>(out.as_mut_ptr(), n) }
        } else {
            // SAFETY: shared path; out is writable for n elements.
            unsafe { self.do_dequeue::<false, true>(out.as_mut_ptr(), n) }
        }
    }

    /// Dequeues up to `out.len()` entries into `out`; returns how many.
    #[inline]
    pub fn dequeue_burst(&self, out: &mut [T]) -> u32 {
        let n = u32::try_from(out.len()).unwrap_or(u32::MAX);
        if self.raw().cons.single {
            // SAFETY: as in dequeue_bulk.
            unsafe { self.do_dequeue::<true, false>(out.as_mut_ptr(), n) }
        } else {
            // SAFETY: as in dequeue_bulk.
            unsafe { self.do_dequeue::<false, false>(out.as_mut_ptr(), n) }
        }
    }

    /// All-or-nothing dequeue over the shared (multi-consumer) path,
    /// regardless of the construction flags.
    #[inline]
    pub fn mc_dequeue_bulk(&self, out: &mut [T]) -> u32 {
        let n = u32::try_from(out.len()).unwrap_or(u32::MAX);
        // SAFETY: shared path; out is writable for n elements.
        unsafe { self.do_dequeue::<false, true>(out.as_mut_ptr(), n) }
    }

    /// Partial dequeue over the shared (multi-consumer) path.
    #[inline]
    pub fn mc_dequeue_burst(&self, out: &mut [T]) -> u32 {
        let n = u32::try_from(out.len()).unwrap_or(u32::MAX);
        // SAFETY: shared path; out is writable for n elements.
        unsafe { self.do_dequeue::<false, false>(out.as_mut_ptr(), n) }
    }

    /// All-or-nothing dequeue over the exclusive (single-consumer) path.
    ///
    /// # Safety
    ///
    /// Caller must be the only thread dequeuing on this ring for the
    /// duration of the call.
    #[inline]
    pub unsafe fn sc_dequeue_bulk(&self, out: &mut [T]) -> u32 {
        let n = u32::try_from(out.len()).unwrap_or(u32::MAX);
        // SAFETY: exclusivity is the caller's contract; out is writable
        // for n elements.
        unsafe { self.do_dequeue::<true, true>(out.as_mut_ptr(), n) }
    }

    /// Partial dequeue over the exclusive (single-consumer) path.
    ///
    /// # Safety
    ///
    /// Caller must be the only thread dequeuing on this ring for the
    /// duration of the call.
    #[inline]
    pub unsafe fn sc_dequeue_burst(&self, out: &mut [T]) -> u32 {
        let n = u32::try_from(out.len()).unwrap_or(u32::MAX);
        // SAFETY: exclusivity is the caller's contract; out is writable
        // for n elements.
        unsafe { self.do_dequeue::<true, false>(out.as_mut_ptr(), n) }
    }

    /// Dequeues one item, or `None` if the ring is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let mut slot = MaybeUninit::<T>::uninit();
        let n = if self.raw().cons.single {
            // SAFETY: one writable slot; SC_DEQ contract as in
            // dequeue_bulk.
            unsafe { self.do_dequeue::<true, true>(slot.as_mut_ptr(), 1) }
        } else {
            // SAFETY: one writable slot.
            unsafe { self.do_dequeue::<false, true>(slot.as_mut_ptr(), 1) }
        };
        if n == 1 {
            // SAFETY: the dequeue wrote the slot before publishing.
            Some(unsafe { slot.assume_init() })
        } else {
            None
        }
    }

    // ---- introspection ----------------------------------------------

    /// Entries currently in the ring. A racy snapshot.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.raw().count()
    }

    /// Free entry slots currently in the ring. A racy snapshot.
    #[inline]
    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.raw().capacity - self.count()
    }

    /// Whether the ring is full. A racy snapshot.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    /// Whether the ring is empty. A racy snapshot.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Maximum number of entries the ring holds at once.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.raw().capacity
    }

    /// Slot count of the backing array (a power of two, `> capacity`).
    #[inline]
    #[must_use]
    pub fn size(&self) -> u32 {
        self.raw().size
    }

    /// The flags this ring was constructed with.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> Flags {
        self.raw().flags
    }
}

impl<T, A: RingAllocator> std::fmt::Debug for Ring<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // SAFETY: self.raw points at the initialised header.
        let raw = unsafe { self.raw.as_ref() };
        f.debug_struct("Ring")
            .field("flags", &raw.flags)
            .field("size", &raw.size)
            .field("capacity", &raw.capacity)
            .field("count", &raw.count())
            .finish_non_exhaustive()
    }
}

impl<T, A: RingAllocator> Drop for Ring<T, A> {
    fn drop(&mut self) {
        // Payloads are plain copies; only the storage needs releasing.
        let layout = Layout::from_size_align(self.bytes, CACHE_LINE_SIZE)
            .expect("layout was validated at construction");
        // SAFETY: same pointer/layout pair the constructor obtained; the
        // handle is going away, so no reference outlives this.
        unsafe { self.alloc.dealloc(self.raw.cast(), layout) };
    }
}
