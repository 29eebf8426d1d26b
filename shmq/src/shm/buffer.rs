//! Named shared-memory buffer used as a placement arena.
//!
//! [`ShmBuffer`] owns a mapped region and hands out sub-ranges through a
//! monotonic bump cursor. Queues are constructed in place inside those
//! ranges; other processes attach to the same name and reinterpret the same
//! offsets with [`ShmBuffer::view`]. There is no deallocation: an
//! allocation lives as long as the arena's name does.
//!
//! # Ownership
//!
//! The `Mode` type parameter decides cleanup at compile time, so the two
//! sides of a shared region cannot accidentally swap responsibilities:
//!
//! - [`Create`] - creates and sizes the region; on drop it unmaps **and**
//!   unlinks the name.
//! - [`Attach`] - attaches to an existing region; on drop it only unmaps,
//!   leaving the name for the creator to release.
//!
//! Both are move-only values; there is no way to copy a buffer or to
//! observe a moved-from one.
//!
//! # Example
//!
//! ```no_run
//! use shmq::shm::{Attach, Create, ShmBuffer, ShmName};
//!
//! let name = ShmName::new("/scratch")?;
//! let mut owner = ShmBuffer::<Create>::create(name.clone(), 1 << 16)?;
//! let _block = owner.allocate(128).unwrap();
//!
//! let peer = ShmBuffer::<Attach>::attach(name, 1 << 16)?;
//! assert_eq!(peer.capacity(), 1 << 16);
//! # Ok::<(), shmq::shm::ShmError>(())
//! ```

use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use super::os::{self, Result, ShmError, ShmName};
use super::ShmSafe;

/// Cleanup behavior of a buffer, chosen at compile time.
///
/// Implemented by the [`Create`] and [`Attach`] markers; not meant to be
/// implemented outside this module.
pub trait Mode {
    /// Whether dropping the buffer releases the region's name.
    const UNLINK: bool;
}

/// Marker for the process that creates and owns a region's name.
pub struct Create;
impl Mode for Create {
    const UNLINK: bool = true;
}

/// Marker for processes that attach to an existing region.
pub struct Attach;
impl Mode for Attach {
    const UNLINK: bool = false;
}

/// A mapped, named shared-memory region with a bump-allocation cursor.
pub struct ShmBuffer<M: Mode> {
    base: NonNull<u8>,
    capacity: usize,
    size: usize,
    name: ShmName,
    _mode: PhantomData<M>,
}

// SAFETY: the buffer points into a shared mapping, not thread-local data;
// moving it between threads moves only the handle.
unsafe impl<M: Mode> Send for ShmBuffer<M> {}

// SAFETY: &self access is read-only (accessors and bounds-checked views);
// all mutation of the cursor requires &mut self.
unsafe impl<M: Mode> Sync for ShmBuffer<M> {}

impl ShmBuffer<Create> {
    /// Creates the named region, sizes it to `capacity` bytes, and maps it.
    ///
    /// The fresh region is zero-filled by the kernel. Fails with
    /// [`ShmError::AlreadyExists`] if another live creator holds the name.
    pub fn create(name: ShmName, capacity: usize) -> Result<Self> {
        let fd = os::create(&name, capacity)?;
        let base = match os::map(&fd, capacity, &name) {
            Ok(base) => base,
            Err(err) => {
                // The name is ours; release it rather than leak the region.
                drop(fd);
                let _ = os::unlink(&name);
                return Err(err);
            }
        };

        // The mapping keeps the object alive; the descriptor is no longer
        // needed once the view is installed.
        Ok(Self {
            base,
            capacity,
            size: 0,
            name,
            _mode: PhantomData,
        })
    }
}

impl ShmBuffer<Attach> {
    /// Attaches to an existing region and maps `capacity` bytes of it.
    ///
    /// Fails with [`ShmError::NotFound`] if nobody created the name, or
    /// [`ShmError::SizeMismatch`] if the live region is smaller than the
    /// capacity being attached.
    pub fn attach(name: ShmName, capacity: usize) -> Result<Self> {
        let fd = os::open(&name)?;

        let actual = os::region_len(&fd, &name)?;
        if actual < capacity as u64 {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected: capacity,
                actual,
            });
        }

        let base = os::map(&fd, capacity, &name)?;
        Ok(Self {
            base,
            capacity,
            size: 0,
            name,
            _mode: PhantomData,
        })
    }
}

impl<M: Mode> ShmBuffer<M> {
    /// Reserves the next `len` bytes of the region.
    ///
    /// Returns `None` when the remaining capacity is insufficient. The
    /// cursor only moves forward; there is no way to give bytes back.
    pub fn allocate(&mut self, len: usize) -> Option<NonNull<u8>> {
        let next = self.size.checked_add(len)?;
        if next > self.capacity {
            return None;
        }
        // SAFETY: size <= next <= capacity, so the offset stays inside the
        // mapping.
        let ptr = unsafe { self.base.add(self.size) };
        self.size = next;
        Some(ptr)
    }

    /// Reserves space for a `T` and constructs it in place.
    ///
    /// The cursor is first padded up to `align_of::<T>()`. `init` receives
    /// a pointer to uninitialized, correctly aligned storage and must leave
    /// it fully initialized; the queues expose `init_at` functions for
    /// exactly this. In-place construction matters because queue objects
    /// are far too large to build on the stack and copy in.
    pub fn allocate_with<T: ShmSafe>(
        &mut self,
        init: impl FnOnce(*mut T),
    ) -> Option<NonNull<T>> {
        let align = align_of::<T>();
        let padding = self.size.next_multiple_of(align) - self.size;
        if padding > 0 {
            self.allocate(padding)?;
        }

        let ptr = self.allocate(size_of::<T>())?.cast::<T>();
        init(ptr.as_ptr());
        Some(ptr)
    }

    /// Reinterprets the bytes at `offset` as a `T`.
    ///
    /// Returns `None` if `offset + size_of::<T>()` exceeds the capacity or
    /// the offset is misaligned for `T`. This is how attaching processes
    /// reach objects the creator placed at known offsets; the caller is
    /// responsible for the offset actually holding an initialized `T`.
    pub fn view<T: ShmSafe>(&self, offset: usize) -> Option<NonNull<T>> {
        let end = offset.checked_add(size_of::<T>())?;
        if end > self.capacity {
            return None;
        }
        // SAFETY: offset < end <= capacity.
        let ptr = unsafe { self.base.add(offset) };
        if ptr.as_ptr() as usize % align_of::<T>() != 0 {
            return None;
        }
        Some(ptr.cast())
    }

    /// Base address of the mapped region in this process.
    pub fn data(&self) -> NonNull<u8> {
        self.base
    }

    /// Total bytes mapped.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes handed out so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The region's host-wide name.
    pub fn name(&self) -> &ShmName {
        &self.name
    }
}

impl<M: Mode> Drop for ShmBuffer<M> {
    fn drop(&mut self) {
        // SAFETY: base/capacity are the exact pair returned by os::map, and
        // the buffer is being destroyed so no borrows remain.
        unsafe {
            os::unmap(self.base, self.capacity);
        }

        if M::UNLINK {
            let _ = os::unlink(&self.name);
        }
    }
}
