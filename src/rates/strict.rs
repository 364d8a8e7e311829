//! Isochronous specialization of the ticks-accumulator limiter.

use std::sync::Arc;

use super::average::AverageRateLimiter;
use super::clock::{NanoClock, SystemClock};
use super::{RateLimiter, RateSpec};
use crate::error::{Error, Result};

/// A rate limiter pinned to strictness 1.0: every unused scheduling gap is
/// forfeited in full, so grants stay aligned to their ideal boundaries
/// modulo OS sleep jitter. Exists as a distinct type so callers can inject
/// a test clock while stating the pacing discipline in the type.
pub struct StrictRateLimiter {
    inner: Arc<AverageRateLimiter>,
}

impl StrictRateLimiter {
    pub fn new(label: &str, spec: RateSpec) -> Result<Arc<Self>> {
        Self::with_clock(label, spec, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(label: &str, spec: RateSpec, clock: Arc<dyn NanoClock>) -> Result<Arc<Self>> {
        let spec = Self::pin_strictness(spec)?;
        Ok(Arc::new(Self {
            inner: AverageRateLimiter::with_clock(label, spec, clock)?,
        }))
    }

    fn pin_strictness(spec: RateSpec) -> Result<RateSpec> {
        if spec.strictness != 1.0 {
            return Err(Error::StrictnessNotStrict(spec.strictness));
        }
        Ok(spec)
    }
}

impl RateLimiter for StrictRateLimiter {
    fn start(&self) {
        self.inner.start();
    }

    fn acquire(&self) -> i64 {
        self.inner.acquire()
    }

    fn acquire_nanos(&self, nanos: i64) -> i64 {
        self.inner.acquire_nanos(nanos)
    }

    fn update(&self, spec: RateSpec) -> Result<()> {
        self.inner.update(Self::pin_strictness(spec)?)
    }

    fn rate(&self) -> f64 {
        self.inner.rate()
    }

    fn strictness(&self) -> f64 {
        self.inner.strictness()
    }

    fn spec(&self) -> RateSpec {
        self.inner.spec()
    }

    fn total_scheduling_delay(&self) -> i64 {
        self.inner.total_scheduling_delay()
    }

    fn rate_scheduling_delay(&self) -> i64 {
        self.inner.rate_scheduling_delay()
    }
}
