use std::{sync::Arc, time::Instant};

/// A trait for time sources that return a monotonic millisecond timestamp.
///
/// The correlator reads time exclusively through this trait, which allows a
/// mocked time source to drive garbage collection in tests.
///
/// # Example
///
/// ```
/// use ipc_worker::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// let time = FixedTime;
/// assert_eq!(time.current_millis(), 1234);
/// ```
pub trait TimeSource: Send + Sync + 'static {
    /// Returns the current time in milliseconds since an arbitrary origin.
    fn current_millis(&self) -> u64;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }
}

/// A monotonic time source measuring elapsed time since construction.
///
/// Immune to wall-clock adjustments, which is all that relative expiry
/// checks need.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}
