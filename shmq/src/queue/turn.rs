//! Lock-free bounded MPMC queue of fixed-size elements.
//!
//! # Algorithm
//!
//! Every slot carries a 64-bit *turn* counter; `head` and `tail` hand out
//! monotonically increasing tickets. A ticket `k` maps to slot `k % N` in
//! round `k / N`, and the slot's turn encodes both the round and the
//! half-phase of the handoff:
//!
//! - `turn == 2r` - free, waiting for the producer of round `r`
//! - `turn == 2r + 1` - holds the element of round `r`, waiting for that
//!   round's consumer
//! - `turn == 2(r + 1)` - consumed, free again for the next round
//!
//! Producers and consumers of the same round meet at each slot; a turn
//! mismatch means the other side has not arrived yet. Contention is
//! confined to the two ticket counters - producers and consumers targeting
//! distinct slots proceed fully in parallel.
//!
//! Ordering is strict FIFO *per ticket*: the element pushed with ticket `k`
//! is the element popped with ticket `k`. A producer that stalls between
//! taking ticket `k` and publishing it stalls every consumer holding a
//! ticket `>= k`; that is the price of FIFO.
//!
//! # Placement
//!
//! The queue is `#[repr(C)]`, pointer-free, and sized entirely by its const
//! parameters, so it can be constructed in place inside a
//! [`ShmBuffer`](crate::shm::ShmBuffer) and driven from every process that
//! maps the region. All coordination is acquire/release atomics; blocking
//! variants busy-spin and never enter the kernel.
//!
//! # Example
//!
//! ```
//! # use shmq::queue::TurnQueue;
//! let queue: Box<TurnQueue<u64, 8>> = TurnQueue::boxed();
//! assert!(queue.try_push(1).is_ok());
//! assert!(queue.try_push(2).is_ok());
//! assert_eq!(queue.try_pop(), Some(1));
//! assert_eq!(queue.try_pop(), Some(2));
//! assert_eq!(queue.try_pop(), None);
//! ```

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::{NonNull, addr_of_mut};
use std::sync::atomic::{AtomicU64, Ordering};

use super::CacheAligned;
use crate::shm::{Mode, ShmBuffer, ShmSafe};

/// One cell of the queue: a turn counter and storage for one element.
///
/// Aligned to a full cache line so adjacent slots never share one; the
/// element storage rides in the turn's line (or the following lines for
/// large `T`), tail-padded by the alignment.
#[repr(C, align(128))]
struct Slot<T> {
    turn: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Lock-free bounded MPMC queue of `T`, placement-constructible into
/// shared memory.
///
/// `N` is the slot count; the nominal capacity is `N - 1`, with one slot of
/// slack in the layout (stable Rust cannot spell `[Slot<T>; CAP + 1]`, so
/// the parameter names the whole array). `N` must be at least 2.
///
/// `T` must be [`ShmSafe`]: it is copied byte-wise across a shared-memory
/// boundary, so it cannot carry pointers, and it must not rely on its
/// destructor running - elements still resident when a process unmaps are
/// simply gone.
#[repr(C)]
pub struct TurnQueue<T, const N: usize> {
    slots: [Slot<T>; N],
    head: CacheAligned<AtomicU64>,
    tail: CacheAligned<AtomicU64>,
}

// SAFETY: the queue is a bag of atomics plus element storage handed between
// threads under the turn protocol; T: ShmSafe already requires Send + Sync.
unsafe impl<T: ShmSafe, const N: usize> Send for TurnQueue<T, N> {}

// SAFETY: concurrent access is mediated entirely by the ticket counters and
// per-slot turns:
// - a producer writes a slot only between winning the head CAS (or
//   fetch_add) for its ticket and release-storing the odd turn
// - a consumer reads a slot only between winning the tail CAS for the
//   matching ticket and release-storing the next even turn
// so no two threads ever access a slot's storage at the same time.
unsafe impl<T: ShmSafe, const N: usize> Sync for TurnQueue<T, N> {}

// SAFETY: repr(C), fixed size, no pointers; all shared mutable state is
// atomics. Valid at any mapped address.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for TurnQueue<T, N> {}

impl<T: ShmSafe, const N: usize> TurnQueue<T, N> {
    const SLOTS_OK: () = assert!(N >= 2, "TurnQueue needs at least 2 slots");

    /// Slot index of ticket `k`.
    #[inline]
    const fn idx(ticket: u64) -> usize {
        (ticket % N as u64) as usize
    }

    /// Wrap count of ticket `k`.
    #[inline]
    const fn round(ticket: u64) -> u64 {
        ticket / N as u64
    }

    /// Initializes a queue directly inside raw memory.
    ///
    /// All turns and both ticket counters start at zero; element storage
    /// stays uninitialized until a producer writes it.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, aligned for `Self`, writable for
    /// `size_of::<Self>()` bytes, and not aliased by any other reference
    /// during initialization.
    pub unsafe fn init_at(ptr: *mut Self) {
        let () = Self::SLOTS_OK;

        // SAFETY: caller guarantees ptr is valid, aligned, writable, and
        // exclusively owned. addr_of_mut! writes the fields without forming
        // references to uninitialized memory.
        unsafe {
            let slots = addr_of_mut!((*ptr).slots).cast::<Slot<T>>();
            for i in 0..N {
                addr_of_mut!((*slots.add(i)).turn).write(AtomicU64::new(0));
            }
            addr_of_mut!((*ptr).head).write(CacheAligned(AtomicU64::new(0)));
            addr_of_mut!((*ptr).tail).write(CacheAligned(AtomicU64::new(0)));
        }
    }

    /// Allocates and initializes a queue inside a shared-memory arena.
    ///
    /// Returns `None` if the arena lacks room. The queue lives at the
    /// arena offset that was current (rounded up to the queue's alignment),
    /// which attaching processes pass to
    /// [`ShmBuffer::view`](crate::shm::ShmBuffer::view).
    pub fn create_in<M: Mode>(arena: &mut ShmBuffer<M>) -> Option<NonNull<Self>> {
        // SAFETY: allocate_with hands us aligned, in-bounds, otherwise
        // unreferenced storage, which is exactly what init_at needs.
        arena.allocate_with(|ptr| unsafe { Self::init_at(ptr) })
    }

    /// Allocates and initializes a queue on the heap.
    ///
    /// Process-local convenience for tests and single-process use; the
    /// object is identical to one placed in a region.
    pub fn boxed() -> Box<Self> {
        let () = Self::SLOTS_OK;
        let mut queue = Box::<Self>::new_uninit();
        // SAFETY: fresh heap storage, properly aligned, exclusively owned;
        // init_at initializes every field that is not MaybeUninit.
        unsafe {
            Self::init_at(queue.as_mut_ptr());
            queue.assume_init()
        }
    }

    /// Attempts to push an element without blocking.
    ///
    /// Returns `Err(item)` when the queue is full, handing the element back
    /// for the caller to retry or drop.
    #[inline]
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut head = self.head.0.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[Self::idx(head)];
            if slot.turn.load(Ordering::Acquire) == 2 * Self::round(head) {
                // Slot is free for this round; try to take the ticket.
                match self.head.0.compare_exchange(
                    head,
                    head + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for ticket `head` grants
                        // exclusive write access to this slot: no other
                        // producer holds the ticket, and the turn check says
                        // the consumer of the previous round has released it.
                        unsafe {
                            (*slot.value.get()).write(item);
                        }
                        slot.turn
                            .store(2 * Self::round(head) + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => head = current,
                }
            } else {
                // Turn mismatch: either the queue is full or another
                // producer advanced head under us. A moved head means fresh
                // state to retry with; an unmoved head means full.
                let prev = head;
                head = self.head.0.load(Ordering::Acquire);
                if head == prev {
                    return Err(item);
                }
            }
        }
    }

    /// Pushes an element, spinning while the queue is full.
    ///
    /// Takes its ticket unconditionally, so FIFO position is fixed at the
    /// moment of the call; the spin waits for the slot's previous-round
    /// consumer. Never yields to the kernel.
    #[inline]
    pub fn push(&self, item: T) {
        let head = self.head.0.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[Self::idx(head)];
        let turn = 2 * Self::round(head);
        while slot.turn.load(Ordering::Acquire) != turn {
            std::hint::spin_loop();
        }
        // SAFETY: we hold ticket `head` exclusively (fetch_add) and the
        // turn now matches our round, so the slot storage is ours to write.
        unsafe {
            (*slot.value.get()).write(item);
        }
        slot.turn.store(turn + 1, Ordering::Release);
    }

    /// Attempts to pop the oldest element without blocking.
    #[inline]
    #[must_use]
    pub fn try_pop(&self) -> Option<T> {
        let mut tail = self.tail.0.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[Self::idx(tail)];
            if slot.turn.load(Ordering::Acquire) == 2 * Self::round(tail) + 1 {
                match self.tail.0.compare_exchange(
                    tail,
                    tail + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for ticket `tail` grants
                        // exclusive read access, and the odd turn confirms
                        // the producer's release-store published the value.
                        let item = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.turn
                            .store(2 * (Self::round(tail) + 1), Ordering::Release);
                        return Some(item);
                    }
                    Err(current) => tail = current,
                }
            } else {
                let prev = tail;
                tail = self.tail.0.load(Ordering::Acquire);
                if tail == prev {
                    return None;
                }
            }
        }
    }

    /// Pops the oldest element, spinning while the queue is empty.
    ///
    /// Takes its ticket unconditionally; the spin waits for this round's
    /// producer to publish.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> T {
        let tail = self.tail.0.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[Self::idx(tail)];
        let turn = 2 * Self::round(tail);
        while slot.turn.load(Ordering::Acquire) != turn + 1 {
            std::hint::spin_loop();
        }
        // SAFETY: we hold ticket `tail` exclusively and the producer's
        // release-store has published the value.
        let item = unsafe { (*slot.value.get()).assume_init_read() };
        slot.turn.store(turn + 2, Ordering::Release);
        item
    }

    /// Best-effort element count.
    ///
    /// Negative when consumers hold tickets for elements not yet pushed
    /// (blocking `pop` callers waiting on an empty queue). Exact only once
    /// all producers and consumers have quiesced.
    pub fn size(&self) -> isize {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        head.wrapping_sub(tail) as i64 as isize
    }

    /// Best-effort emptiness check; see [`size`](Self::size).
    pub fn empty(&self) -> bool {
        self.size() <= 0
    }

    /// Nominal capacity in elements.
    pub const fn capacity(&self) -> usize {
        N - 1
    }
}
