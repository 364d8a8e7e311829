//! The ticks-accumulator rate limiter.
//!
//! The scheduling state is a single atomic sum of nanoseconds granted to
//! callers, the *ticks accumulator*. Claiming a grant is one `fetch_add`:
//! the pre-value is the caller's scheduled start time, directly comparable
//! with the monotonic clock. Callers that arrive early sleep in their own
//! thread, outside any critical section, so throughput scales with cores.
//!
//! When callers arrive late, the unused schedule time either remains on the
//! timeline to be absorbed by bursting (strictness 0.0), or is forfeited by
//! advancing the timeline (strictness 1.0). Intermediate strictness closes
//! the gap by `gap >> burst_shift` per grant, where `burst_shift` is the
//! nearest power-of-two equivalent of the strictness ratio.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::clock::{NanoClock, SystemClock};
use super::{RateLimiter, RateSpec};
use crate::error::Result;

pub struct AverageRateLimiter {
    label: String,
    clock: Arc<dyn NanoClock>,
    /// Monotonic sum of granted nanoseconds; the authoritative schedule.
    ticks: AtomicI64,
    /// Cache of the wall clock as last observed by a granted caller.
    last_seen: AtomicI64,
    /// Scheduling delay folded in by past reconfigurations.
    accumulated_delay: AtomicI64,
    op_ticks: AtomicI64,
    burst_shift: AtomicU32,
    report_co_delay: AtomicBool,
    started: AtomicBool,
    /// Guards spec mutation only; `acquire` never touches it.
    spec: Mutex<RateSpec>,
}

/// Convert strictness to the shift applied to unused scheduling gaps.
/// 1.0 maps to 0 (forfeit the whole gap), 0.0 maps to 63 (keep it all).
fn burst_shift_for(strictness: f64) -> u32 {
    if strictness >= 1.0 {
        0
    } else {
        let scaled = (strictness * i64::MAX as f64) as i64;
        scaled.leading_zeros().min(63)
    }
}

impl AverageRateLimiter {
    pub fn new(label: &str, spec: RateSpec) -> Result<Arc<Self>> {
        Self::with_clock(label, spec, Arc::new(SystemClock::new()))
    }

    /// Build with an injected clock, for deterministic scheduling tests.
    pub fn with_clock(label: &str, spec: RateSpec, clock: Arc<dyn NanoClock>) -> Result<Arc<Self>> {
        spec.validate()?;
        let now = clock.nanos();
        let limiter = Arc::new(Self {
            label: label.to_string(),
            clock,
            ticks: AtomicI64::new(now),
            last_seen: AtomicI64::new(now),
            accumulated_delay: AtomicI64::new(0),
            op_ticks: AtomicI64::new(spec.nanos_per_op()),
            burst_shift: AtomicU32::new(burst_shift_for(spec.strictness)),
            report_co_delay: AtomicBool::new(spec.report_co_delay),
            started: AtomicBool::new(false),
            spec: Mutex::new(spec),
        });
        tracing::debug!(
            label = %limiter.label,
            op_ticks = spec.nanos_per_op(),
            "rate limiter configured"
        );
        Ok(limiter)
    }

    /// Build a limiter that takes over from `prior`, inheriting its
    /// accumulated scheduling delay.
    pub fn replacing(label: &str, spec: RateSpec, prior: &dyn RateLimiter) -> Result<Arc<Self>> {
        let limiter = Self::new(label, spec)?;
        limiter
            .accumulated_delay
            .store(prior.total_scheduling_delay(), Ordering::Relaxed);
        Ok(limiter)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn report_enabled(&self) -> bool {
        self.report_co_delay.load(Ordering::Relaxed)
    }
}

impl RateLimiter for AverageRateLimiter {
    fn start(&self) {
        if !self.started.swap(true, Ordering::SeqCst) {
            let now = self.clock.nanos();
            self.ticks.store(now, Ordering::Relaxed);
            self.last_seen.store(now, Ordering::Relaxed);
            self.accumulated_delay.store(0, Ordering::Relaxed);
            tracing::debug!(label = %self.label, origin = now, "rate limiter started");
        }
    }

    fn acquire(&self) -> i64 {
        self.acquire_nanos(self.op_ticks.load(Ordering::Relaxed))
    }

    fn acquire_nanos(&self, nanos: i64) -> i64 {
        let sched = self.ticks.fetch_add(nanos, Ordering::Relaxed);
        let seen = self.last_seen.load(Ordering::Relaxed);

        // Behind a previously observed clock reading: the caller is late by
        // construction, no need to read the clock again.
        if sched < seen {
            return if self.report_enabled() {
                (seen - sched) + self.accumulated_delay.load(Ordering::Relaxed)
            } else {
                0
            };
        }

        let now = self.clock.nanos();
        self.last_seen.store(now, Ordering::Relaxed);
        let gap = now - sched;

        if gap > 0 {
            // Late caller: forfeit part of the unused schedule, shifting the
            // limiter from bursty toward isochronous per the strictness.
            let closing = gap >> self.burst_shift.load(Ordering::Relaxed);
            if closing > 0 {
                self.ticks.fetch_add(closing, Ordering::Relaxed);
            }
            if self.report_enabled() {
                gap + self.accumulated_delay.load(Ordering::Relaxed)
            } else {
                0
            }
        } else {
            if gap < 0 {
                thread::sleep(Duration::from_nanos((-gap) as u64));
            }
            0
        }
    }

    fn update(&self, new_spec: RateSpec) -> Result<()> {
        new_spec.validate()?;
        let mut guard = self.spec.lock();
        if *guard == new_spec {
            return Ok(());
        }
        if self.started.load(Ordering::SeqCst) {
            // Fold the outstanding rate delay into the accumulator and
            // re-origin the timeline, so the total reported delay is
            // unchanged across the reconfiguration.
            let now = self.clock.nanos();
            let rate_delay = now - self.ticks.load(Ordering::Relaxed);
            self.accumulated_delay.fetch_add(rate_delay, Ordering::Relaxed);
            self.ticks.store(now, Ordering::Relaxed);
            self.last_seen.store(now, Ordering::Relaxed);
        }
        self.op_ticks.store(new_spec.nanos_per_op(), Ordering::Relaxed);
        self.burst_shift
            .store(burst_shift_for(new_spec.strictness), Ordering::Relaxed);
        self.report_co_delay
            .store(new_spec.report_co_delay, Ordering::Relaxed);
        tracing::info!(
            label = %self.label,
            ops_per_sec = new_spec.ops_per_sec,
            strictness = new_spec.strictness,
            op_ticks = new_spec.nanos_per_op(),
            "rate limiter updated"
        );
        *guard = new_spec;
        Ok(())
    }

    fn rate(&self) -> f64 {
        self.spec.lock().ops_per_sec
    }

    fn strictness(&self) -> f64 {
        self.spec.lock().strictness
    }

    fn spec(&self) -> RateSpec {
        *self.spec.lock()
    }

    fn total_scheduling_delay(&self) -> i64 {
        if self.report_enabled() {
            self.rate_scheduling_delay() + self.accumulated_delay.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    fn rate_scheduling_delay(&self) -> i64 {
        if self.report_enabled() {
            self.clock.nanos() - self.ticks.load(Ordering::Relaxed)
        } else {
            0
        }
    }
}
