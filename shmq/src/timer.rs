//! Scoped duration recorder for benchmarks and tests.

use minstant::Instant;

/// Records the nanoseconds a scope took into a caller-supplied slot.
///
/// Captures a monotonic timestamp at construction and writes `now - start`
/// on drop, so the measured region is exactly the timer's lexical scope:
///
/// ```
/// # use shmq::timer::Timer;
/// let mut elapsed_ns = 0u64;
/// {
///     let _timer = Timer::new(&mut elapsed_ns);
///     std::thread::sleep(std::time::Duration::from_millis(1));
/// }
/// assert!(elapsed_ns > 0);
/// ```
pub struct Timer<'a> {
    start: Instant,
    elapsed_ns: &'a mut u64,
}

impl<'a> Timer<'a> {
    pub fn new(elapsed_ns: &'a mut u64) -> Self {
        Self {
            start: Instant::now(),
            elapsed_ns,
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        *self.elapsed_ns = self.start.elapsed().as_nanos() as u64;
    }
}
