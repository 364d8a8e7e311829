//! Rate limiting — nanosecond-precision pacing for cycle dispatch.
//!
//! Two mechanisms are provided:
//!
//! - [`AverageRateLimiter`] / [`StrictRateLimiter`]: a ticks-accumulator
//!   limiter. A shared atomic timeline of granted nanoseconds linearizes
//!   concurrent callers; each `acquire` claims a disjoint slice of the
//!   schedule and sleeps in the calling thread if that slice is still in the
//!   future. A strictness knob in `[0, 1]` blends isochronous pacing
//!   (every grant on its ideal boundary) with average-rate pacing
//!   (slow starts repaid by bursts).
//! - [`TokenPool`](token_pool::TokenPool) + [`TokenFiller`](token_filler::TokenFiller):
//!   a two-bucket token accumulator refilled by a dedicated thread, for
//!   callers that want to draw down nanosecond grants in their own units.
//!
//! All limiters share the [`RateSpec`] configuration value and the
//! [`RateLimiter`] contract used by the motor.

pub mod average;
pub mod clock;
pub mod strict;
pub mod token_filler;
pub mod token_pool;

pub use average::AverageRateLimiter;
pub use clock::{monotonic_nanos, NanoClock, SystemClock, TestClock};
pub use strict::StrictRateLimiter;
pub use token_filler::{TokenFiller, TokenFillerHandle};
pub use token_pool::TokenPool;

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::activity::ActivityDef;
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;

/// One nanosecond-denominated second; the ceiling for representable rates.
pub const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// The target rate and pacing discipline for a rate limiter.
///
/// Two specs are equivalent iff all three fields are equal; limiters use
/// that to skip no-op updates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateSpec {
    /// Target operations per second. Must be in `(0, 1e9]`.
    pub ops_per_sec: f64,
    /// `1.0` enforces isochronous grants; `0.0` lets unused schedule time be
    /// absorbed by later bursts; intermediate values close unused gaps by a
    /// power-of-two proportion per grant.
    pub strictness: f64,
    /// When set, `acquire` returns the coordinated-omission delay the caller
    /// has accumulated instead of zero.
    pub report_co_delay: bool,
}

impl RateSpec {
    pub fn new(ops_per_sec: f64, strictness: f64) -> Result<Self> {
        let spec = Self {
            ops_per_sec,
            strictness,
            report_co_delay: false,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Enable coordinated-omission delay reporting on this spec.
    pub fn reporting_co_delay(mut self) -> Self {
        self.report_co_delay = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.ops_per_sec <= 0.0 {
            return Err(Error::RateTooLow(self.ops_per_sec));
        }
        if self.ops_per_sec > NANOS_PER_SECOND {
            return Err(Error::RateTooHigh(self.ops_per_sec));
        }
        if !(0.0..=1.0).contains(&self.strictness) {
            return Err(Error::StrictnessOutOfRange(self.strictness));
        }
        Ok(())
    }

    /// Nanoseconds of schedule consumed by one grant at the target rate.
    pub fn nanos_per_op(&self) -> i64 {
        (NANOS_PER_SECOND / self.ops_per_sec) as i64
    }
}

impl FromStr for RateSpec {
    type Err = Error;

    /// Parse `"<ops/s>[,<strictness>[,co]]"`, the format accepted by the
    /// `cyclerate`, `striderate` and `phaserate` activity parameters.
    fn from_str(s: &str) -> Result<Self> {
        let parse_err = |reason: &str| Error::RateSpecParse {
            spec: s.to_string(),
            reason: reason.to_string(),
        };
        let mut parts = s.split(',').map(str::trim);
        let rate = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| parse_err("missing ops/s"))?
            .parse::<f64>()
            .map_err(|_| parse_err("ops/s is not a number"))?;
        let strictness = match parts.next() {
            Some(p) => p
                .parse::<f64>()
                .map_err(|_| parse_err("strictness is not a number"))?,
            None => 0.0,
        };
        let report = match parts.next() {
            Some("co") => true,
            Some(other) => return Err(parse_err(&format!("unrecognized flag '{other}'"))),
            None => false,
        };
        if parts.next().is_some() {
            return Err(parse_err("too many fields"));
        }
        let mut spec = RateSpec::new(rate, strictness)?;
        spec.report_co_delay = report;
        Ok(spec)
    }
}

/// The contract the motor holds rate limiters to.
///
/// All methods take `&self`: a limiter is shared by every motor thread of an
/// activity. `acquire` must never take the reconfiguration lock.
pub trait RateLimiter: Send + Sync {
    /// Idempotent; re-origins the scheduling timeline at the current clock.
    fn start(&self);

    /// Block until the next grant at the configured rate is due. Returns the
    /// coordinated-omission delay in nanoseconds when reporting is enabled,
    /// otherwise 0.
    fn acquire(&self) -> i64;

    /// Like [`acquire`](Self::acquire), but claims a caller-specified
    /// nanosecond budget (used for stride-sized allowances).
    fn acquire_nanos(&self, nanos: i64) -> i64;

    /// Online reconfiguration. Accumulated scheduling delay is preserved
    /// across the change.
    fn update(&self, spec: RateSpec) -> Result<()>;

    fn rate(&self) -> f64;

    fn strictness(&self) -> f64;

    fn spec(&self) -> RateSpec;

    /// Rate delay plus everything folded in by prior reconfigurations.
    fn total_scheduling_delay(&self) -> i64;

    /// How far wall-clock has run ahead of the scheduling timeline.
    fn rate_scheduling_delay(&self) -> i64;
}

/// Create a rate limiter for `label`, or apply `spec` to an existing one.
///
/// The gauge `cco-delay-<label>` is registered for newly created limiters.
pub fn create_or_update(
    metrics: &MetricsRegistry,
    def: &ActivityDef,
    label: &str,
    existing: Option<Arc<dyn RateLimiter>>,
    spec: RateSpec,
) -> Result<Arc<dyn RateLimiter>> {
    match existing {
        Some(limiter) => {
            limiter.update(spec)?;
            Ok(limiter)
        }
        None => {
            let limiter = AverageRateLimiter::new(label, spec)?;
            let gauge_source = Arc::clone(&limiter);
            metrics.gauge(def, &format!("cco-delay-{label}"), move || {
                gauge_source.total_scheduling_delay()
            });
            Ok(limiter)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parses_rate_only() {
        let spec: RateSpec = "1000".parse().unwrap();
        assert_eq!(spec.ops_per_sec, 1000.0);
        assert_eq!(spec.strictness, 0.0);
        assert!(!spec.report_co_delay);
    }

    #[test]
    fn spec_parses_strictness_and_reporting() {
        let spec: RateSpec = "2500,0.5,co".parse().unwrap();
        assert_eq!(spec.ops_per_sec, 2500.0);
        assert_eq!(spec.strictness, 0.5);
        assert!(spec.report_co_delay);
    }

    #[test]
    fn spec_rejects_out_of_range_rates() {
        assert!(matches!(
            RateSpec::new(0.0, 0.5),
            Err(Error::RateTooLow(_))
        ));
        assert!(matches!(
            RateSpec::new(-10.0, 0.5),
            Err(Error::RateTooLow(_))
        ));
        assert!(matches!(
            RateSpec::new(2e9, 0.5),
            Err(Error::RateTooHigh(_))
        ));
    }

    #[test]
    fn spec_rejects_out_of_range_strictness() {
        assert!(matches!(
            RateSpec::new(100.0, 1.5),
            Err(Error::StrictnessOutOfRange(_))
        ));
        assert!(matches!(
            "100,-0.1".parse::<RateSpec>(),
            Err(Error::StrictnessOutOfRange(_))
        ));
    }

    #[test]
    fn spec_rejects_malformed_strings() {
        assert!("".parse::<RateSpec>().is_err());
        assert!("fast".parse::<RateSpec>().is_err());
        assert!("100,0.5,xx".parse::<RateSpec>().is_err());
        assert!("100,0.5,co,zz".parse::<RateSpec>().is_err());
    }

    #[test]
    fn specs_compare_on_all_fields() {
        let a = RateSpec::new(100.0, 0.5).unwrap();
        let b = RateSpec::new(100.0, 0.5).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, b.reporting_co_delay());
        assert_ne!(a, RateSpec::new(100.0, 0.6).unwrap());
        assert_ne!(a, RateSpec::new(200.0, 0.5).unwrap());
    }

    #[test]
    fn nanos_per_op_for_round_rates() {
        assert_eq!(RateSpec::new(1000.0, 0.0).unwrap().nanos_per_op(), 1_000_000);
        assert_eq!(RateSpec::new(1.0, 0.0).unwrap().nanos_per_op(), 1_000_000_000);
        assert_eq!(RateSpec::new(0.5, 0.0).unwrap().nanos_per_op(), 2_000_000_000);
    }
}
