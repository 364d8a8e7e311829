//! Two-bucket token accumulator for fine-grained rate control.

use parking_lot::Mutex;

use super::RateSpec;
use crate::error::{Error, Result};

/// Sizing floor so high rates still get a usefully deep pool: at least one
/// millisecond of schedule, and at least this many ops' worth of nanoseconds.
const MIN_POOL_NANOS: i64 = 1_000_000;
const MIN_CONCURRENT_OPS: i64 = 10;

/// A pool of nanosecond-denominated tokens with an *active* bucket that
/// callers draw from and a *waiting* bucket that holds schedule time the
/// active bucket could not absorb.
///
/// The active bucket caps at `pool_size × burst_ratio`: the slack above
/// `pool_size` is the burst headroom. Each refill first tops up the active
/// bucket to `pool_size`, overflows the remainder into the waiting bucket,
/// then backfills the burst headroom from the waiting bucket — so time
/// banked while callers were slow is repaid as a bounded burst.
pub struct TokenPool {
    inner: Mutex<PoolState>,
}

struct PoolState {
    pool_size: i64,
    burst_pool_size: i64,
    max_over_active: i64,
    burst_ratio: f64,
    active: i64,
    waiting: i64,
}

impl PoolState {
    fn resize(&mut self, pool_size: i64, burst_ratio: f64) {
        self.pool_size = pool_size;
        self.burst_ratio = burst_ratio;
        self.burst_pool_size = (pool_size as f64 * (burst_ratio - 1.0)) as i64;
        self.max_over_active = self.pool_size + self.burst_pool_size;
    }
}

impl TokenPool {
    /// A pool with an explicit size, mostly useful for tests; production
    /// callers size pools from a [`RateSpec`] via [`TokenPool::from_spec`].
    pub fn new(pool_size: i64, burst_ratio: f64) -> Result<Self> {
        if burst_ratio < 1.0 {
            return Err(Error::BurstRatioTooLow(burst_ratio));
        }
        let mut state = PoolState {
            pool_size: 0,
            burst_pool_size: 0,
            max_over_active: 0,
            burst_ratio,
            active: 0,
            waiting: 0,
        };
        state.resize(pool_size, burst_ratio);
        Ok(Self {
            inner: Mutex::new(state),
        })
    }

    pub fn from_spec(spec: &RateSpec, burst_ratio: f64) -> Result<Self> {
        spec.validate()?;
        Self::new(Self::pool_size_for(spec), burst_ratio)
    }

    fn pool_size_for(spec: &RateSpec) -> i64 {
        MIN_POOL_NANOS.max(spec.nanos_per_op() * MIN_CONCURRENT_OPS)
    }

    /// Add `nanos` of schedule time. Returns the active pool level.
    pub fn refill(&self, nanos: i64) -> i64 {
        self.refill_proportion(nanos, 1.0)
    }

    /// Refill variant where `proportion` scales how much of the burst
    /// headroom may be backfilled from the waiting bucket on this call.
    pub fn refill_proportion(&self, nanos: i64, proportion: f64) -> i64 {
        let mut s = self.inner.lock();
        let needed = (s.pool_size - s.active).max(0);
        let to_active = nanos.min(needed);
        s.active += to_active;
        s.waiting += nanos - to_active;

        let headroom = ((s.max_over_active - s.active).max(0) as f64 * proportion) as i64;
        let backfill = headroom.min(s.waiting);
        s.waiting -= backfill;
        s.active += backfill;
        s.active
    }

    /// Take up to `n` tokens from the active bucket; returns how many were
    /// actually available.
    pub fn take_up_to(&self, n: i64) -> i64 {
        let mut s = self.inner.lock();
        let taken = n.min(s.active).max(0);
        s.active -= taken;
        taken
    }

    /// Rescale the pool for a new rate, preserving the fullness ratio of
    /// both buckets.
    pub fn apply(&self, spec: &RateSpec) -> Result<()> {
        spec.validate()?;
        let mut s = self.inner.lock();
        let active_fill = s.active as f64 / s.pool_size as f64;
        let waiting_fill = s.waiting as f64 / s.pool_size as f64;
        let ratio = s.burst_ratio;
        s.resize(Self::pool_size_for(spec), ratio);
        s.active = ((s.pool_size as f64 * active_fill) as i64).min(s.max_over_active);
        s.waiting = (s.pool_size as f64 * waiting_fill) as i64;
        Ok(())
    }

    pub fn active_pool(&self) -> i64 {
        self.inner.lock().active
    }

    pub fn waiting_pool(&self) -> i64 {
        self.inner.lock().waiting
    }

    pub fn pool_size(&self) -> i64 {
        self.inner.lock().pool_size
    }
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.lock();
        f.debug_struct("TokenPool")
            .field("pool_size", &s.pool_size)
            .field("burst_pool_size", &s.burst_pool_size)
            .field("active", &s.active)
            .field("waiting", &s.waiting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_at_full_rate() {
        let p = TokenPool::new(100, 1.1).unwrap();
        assert_eq!(p.refill(100), 100);
        assert_eq!(p.waiting_pool(), 0);
        assert_eq!(p.refill(100), 110);
        assert_eq!(p.waiting_pool(), 90);
        assert_eq!(p.refill(10), 110);
        assert_eq!(p.waiting_pool(), 100);

        assert_eq!(p.refill(10), 110);
        assert_eq!(p.take_up_to(100), 100);
    }

    #[test]
    fn backfill_proportional() {
        let p = TokenPool::new(100, 1.1).unwrap();
        assert_eq!(p.refill(100), 100);
        assert_eq!(p.waiting_pool(), 0);
        assert_eq!(p.refill_proportion(100, 0.5), 105);
        assert_eq!(p.waiting_pool(), 95);
        assert_eq!(p.refill(10), 110);
        assert_eq!(p.waiting_pool(), 100);

        assert_eq!(p.refill(10), 110);
        assert_eq!(p.take_up_to(100), 100);
    }

    #[test]
    fn take_ranges() {
        let p = TokenPool::new(100, 10.0).unwrap();
        p.refill(100);
        assert_eq!(p.take_up_to(99), 99);
        assert_eq!(p.take_up_to(10), 1);
        assert_eq!(p.take_up_to(1), 0);
    }

    #[test]
    fn pool_sized_from_spec_absorbs_deep_refills() {
        let spec = RateSpec::new(1000.0, 0.0).unwrap();
        let p = TokenPool::from_spec(&spec, 1.1).unwrap();
        let r = p.refill(10_000_000);
        assert_eq!(r, 10_000_000);
        assert_eq!(p.active_pool(), 10_000_000);
        assert_eq!(p.waiting_pool(), 0);

        let faster = RateSpec::new(1_000_000.0, 0.0).unwrap();
        p.apply(&faster).unwrap();
        assert_eq!(p.pool_size(), MIN_POOL_NANOS);
    }

    #[test]
    fn rejects_sub_unit_burst_ratio() {
        assert!(matches!(
            TokenPool::new(100, 0.9),
            Err(Error::BurstRatioTooLow(_))
        ));
    }

    #[test]
    fn buckets_stay_in_range_under_mixed_traffic() {
        let p = TokenPool::new(1000, 1.5).unwrap();
        for i in 0..200i64 {
            p.refill((i % 37) * 100);
            p.take_up_to((i % 11) * 120);
            let active = p.active_pool();
            assert!((0..=1500).contains(&active), "active out of range: {active}");
            assert!(p.waiting_pool() >= 0);
        }
    }
}
