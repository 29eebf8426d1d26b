//! Shared-memory primitives: the OS facade, the arena buffer, and the
//! [`ShmSafe`] marker trait gating what may be placed inside a region.

use std::sync::atomic::*;

pub mod buffer;
pub mod os;

pub use buffer::{Attach, Create, Mode, ShmBuffer};
pub use os::{ShmError, ShmName};

/// Types safe to place in shared memory and access from multiple processes.
///
/// A region mapped by two processes appears at two different virtual
/// addresses, so a `ShmSafe` type must be self-contained:
///
/// | Property | Requirement |
/// |----------|-------------|
/// | Layout | `#[repr(C)]` or `#[repr(transparent)]`; processes may be compiled separately |
/// | Pointers | none - no references, no raw pointers, no heap handles |
/// | Fields | all fields `ShmSafe`, recursively |
/// | Drop | safe if `Drop` never runs; a crashed process unmaps without dropping |
/// | Concurrency | `Send + Sync`; shared mutable state goes through atomics |
///
/// For custom types, use `#[derive(ShmSafe)]` from `shmq-derive` (re-exported
/// at the crate root), which checks the layout and pointer rules at compile
/// time:
///
/// ```
/// use shmq::ShmSafe;
/// use std::sync::atomic::AtomicU64;
///
/// #[derive(ShmSafe)]
/// #[repr(C)]
/// struct Record {
///     producer_id: u64,
///     timestamp_ns: u64,
///     sequence: u64,
/// }
///
/// #[derive(ShmSafe)]
/// #[repr(C)]
/// struct Mailbox {
///     flag: AtomicU64,
///     bytes: [u8; 256],
/// }
/// ```
///
/// # Safety
///
/// Implementers guarantee every property in the table above. The derive
/// macro verifies layout and pointer-freedom; concurrent-access discipline
/// and drop-independence remain the implementer's obligation.
pub unsafe trait ShmSafe: Send + Sync {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmSafe for $t {}
        )*
    };
}

impl_shm_safe! {
    // Signed integers
    i8, i16, i32, i64, i128, isize,
    // Unsigned integers
    u8, u16, u32, u64, u128, usize,
    // Floats
    f32, f64,
    // Bool
    bool,
    // Atomics
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are ShmSafe if their elements are
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}
