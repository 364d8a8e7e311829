use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// A monotonic nanosecond clock.
///
/// Rate limiters compare their scheduling timeline directly against this
/// clock, so the only requirements are nanosecond resolution and
/// monotonicity. Injecting a [`TestClock`] makes the scheduling math
/// testable without real sleeps.
pub trait NanoClock: Send + Sync {
    fn nanos(&self) -> i64;
}

/// The default clock: nanoseconds elapsed since the clock was created.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl NanoClock for SystemClock {
    fn nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }
}

/// A manually driven clock for deterministic scheduling tests.
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Set the clock, returning the previous reading.
    pub fn set(&self, nanos: i64) -> i64 {
        self.now.swap(nanos, Ordering::SeqCst)
    }

    /// Advance the clock, returning the new reading.
    pub fn advance(&self, nanos: i64) -> i64 {
        self.now.fetch_add(nanos, Ordering::SeqCst) + nanos
    }
}

impl NanoClock for TestClock {
    fn nanos(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since the first call in this process. Used for response-time
/// stamps that must be comparable across threads.
pub fn monotonic_nanos() -> i64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as i64
}
