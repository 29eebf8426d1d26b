//! Bounded lock-free MPMC queues placed in POSIX shared memory.
//!
//! The crate has three layers, bottom up:
//!
//! - [`shm::os`] - thin facade over `shm_open`/`mmap` and friends, minting
//!   named, file-backed memory regions.
//! - [`shm::ShmBuffer`] - a mapped region used as a bump arena into which
//!   pointer-free objects are constructed in place, so other processes can
//!   attach to the same name and view the same bytes.
//! - [`queue::TurnQueue`] and [`queue::VarQueue`] - the queues themselves.
//!   Their entire state is the object: no heap, no pointers, capacity fixed
//!   at compile time. The same bytes are valid at whatever virtual address a
//!   process happens to map them.
//!
//! # Example
//!
//! ```no_run
//! use shmq::shm::{Attach, Create, ShmBuffer, ShmName};
//! use shmq::queue::TurnQueue;
//!
//! let name = ShmName::new("/demo-queue")?;
//!
//! // Process A: create the region and construct a queue inside it.
//! let mut owner = ShmBuffer::<Create>::create(name.clone(), 1 << 20)?;
//! let queue = TurnQueue::<u64, 1024>::create_in(&mut owner).unwrap();
//! unsafe { queue.as_ref() }.push(42);
//!
//! // Process B: attach to the same name and view the same queue.
//! let peer = ShmBuffer::<Attach>::attach(name, 1 << 20)?;
//! let queue = peer.view::<TurnQueue<u64, 1024>>(0).unwrap();
//! assert_eq!(unsafe { queue.as_ref() }.try_pop(), Some(42));
//! # Ok::<(), shmq::shm::ShmError>(())
//! ```
//!
//! Cross-process use assumes coherent-cache shared memory; all coordination
//! inside the queues is acquire/release atomics, never locks.

// Allow the crate to reference itself as ::shmq for derive macro usage
extern crate self as shmq;

pub mod queue;
pub mod shm;
pub mod timer;

mod trace;

pub use trace::init_tracing;

#[doc(inline)]
pub use shmq_derive::ShmSafe;

#[doc(inline)]
pub use shm::ShmSafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use shm::ShmSafe as __ShmSafePrivate;
