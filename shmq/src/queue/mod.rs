//! Bounded MPMC queues whose entire state lives inside the object.
//!
//! Both queues are pointer-free and header-self-contained so that the same
//! bytes are valid when mapped at different virtual addresses in different
//! processes:
//!
//! - [`TurnQueue`] - fixed-size elements, per-slot turn sequencing.
//! - [`VarQueue`] - variable-size records over a byte ring with a
//!   triple-cursor reservation protocol.

pub mod turn;
pub mod var;

pub use turn::TurnQueue;
pub use var::VarQueue;

/// Coherence granule assumed by the queue layouts.
///
/// 128 bytes is deliberately conservative: it also covers CPUs whose
/// adjacent-line prefetcher couples pairs of 64-byte lines.
pub const CACHE_LINE: usize = 128;

/// Gives a field its own cache line so logically independent atomics never
/// ping-pong a shared line between cores.
#[repr(C, align(128))]
pub(crate) struct CacheAligned<T>(pub(crate) T);

/// Rounds `len` up to the next cache-line multiple.
pub(crate) const fn align_to_cache_line(len: usize) -> usize {
    (len + CACHE_LINE - 1) & !(CACHE_LINE - 1)
}
