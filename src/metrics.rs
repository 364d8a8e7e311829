//! Metrics — timers and gauges for the cycle-dispatch hot path.
//!
//! The registry is an explicit handle, cloned into every component that
//! records metrics; there is no process-wide singleton. Timers store raw
//! mergeable data (count, sum, min, max) on atomics; derived statistics
//! like the mean belong to the snapshot, which is what reporting channels
//! serialize.
//!
//! Motors register the timers `cycles`, `phases`, `strides` and
//! `read_input`; rate limiters register a `cco-delay-<label>` gauge. Full
//! metric names are `<activity alias>.<name>`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::activity::ActivityDef;
use crate::error::Result;

/// Nanosecond-resolution event timer. `update` is wait-free; snapshots are
/// taken with plain loads and may be slightly torn across fields, which is
/// acceptable for reporting.
pub struct Timer {
    count: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
        }
    }

    /// Record one event of `nanos` duration. Negative values clamp to zero
    /// so wait-time arithmetic can be passed through unconditionally.
    pub fn update(&self, nanos: i64) {
        let nanos = nanos.max(0) as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(nanos, Ordering::Relaxed);
        self.min_ns.fetch_min(nanos, Ordering::Relaxed);
        self.max_ns.fetch_max(nanos, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn total_nanos(&self) -> u64 {
        self.total_ns.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let count = self.count();
        let total_ns = self.total_nanos();
        TimerSnapshot {
            count,
            total_ns,
            mean_ns: if count == 0 { 0 } else { total_ns / count },
            min_ns: match self.min_ns.load(Ordering::Relaxed) {
                u64::MAX => 0,
                v => v,
            },
            max_ns: self.max_ns.load(Ordering::Relaxed),
        }
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    pub count: u64,
    pub total_ns: u64,
    pub mean_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
}

/// A read-on-demand metric backed by a closure.
pub struct Gauge {
    read: Box<dyn Fn() -> i64 + Send + Sync>,
}

impl Gauge {
    pub fn value(&self) -> i64 {
        (self.read)()
    }
}

#[derive(Default)]
struct RegistryInner {
    timers: Mutex<BTreeMap<String, Arc<Timer>>>,
    gauges: Mutex<BTreeMap<String, Gauge>>,
}

/// Shared handle to the metric store. Cheap to clone; all clones observe
/// the same metrics.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<RegistryInner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn full_name(def: &ActivityDef, name: &str) -> String {
        format!("{}.{}", def.alias(), name)
    }

    /// Get or create the timer `<alias>.<name>`.
    pub fn timer(&self, def: &ActivityDef, name: &str) -> Arc<Timer> {
        let mut timers = self.inner.timers.lock();
        Arc::clone(
            timers
                .entry(Self::full_name(def, name))
                .or_insert_with(|| Arc::new(Timer::new())),
        )
    }

    /// Register (or replace) the gauge `<alias>.<name>`.
    pub fn gauge(
        &self,
        def: &ActivityDef,
        name: &str,
        read: impl Fn() -> i64 + Send + Sync + 'static,
    ) {
        self.inner
            .gauges
            .lock()
            .insert(Self::full_name(def, name), Gauge {
                read: Box::new(read),
            });
    }

    pub fn gauge_value(&self, full_name: &str) -> Option<i64> {
        self.inner.gauges.lock().get(full_name).map(Gauge::value)
    }

    pub fn timer_snapshot(&self, full_name: &str) -> Option<TimerSnapshot> {
        self.inner
            .timers
            .lock()
            .get(full_name)
            .map(|t| t.snapshot())
    }

    /// A consistent-enough view of everything registered, for reporting.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let timers = self
            .inner
            .timers
            .lock()
            .iter()
            .map(|(name, t)| (name.clone(), t.snapshot()))
            .collect();
        let gauges: BTreeMap<String, i64> = self
            .inner
            .gauges
            .lock()
            .iter()
            .map(|(name, g)| (name.clone(), g.value()))
            .collect();
        MetricsSnapshot { timers, gauges }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }
}

/// Serializable view of the registry at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timers: BTreeMap<String, TimerSnapshot>,
    pub gauges: BTreeMap<String, i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(alias: &str) -> ActivityDef {
        ActivityDef::parse(&format!("alias={alias}")).unwrap()
    }

    #[test]
    fn timer_accumulates_raw_data() {
        let t = Timer::new();
        t.update(10);
        t.update(30);
        t.update(-5);
        let snap = t.snapshot();
        assert_eq!(snap.count, 3);
        assert_eq!(snap.total_ns, 40);
        assert_eq!(snap.min_ns, 0);
        assert_eq!(snap.max_ns, 30);
        assert_eq!(snap.mean_ns, 13);
    }

    #[test]
    fn empty_timer_snapshot_is_all_zero() {
        let snap = Timer::new().snapshot();
        assert_eq!(
            snap,
            TimerSnapshot {
                count: 0,
                total_ns: 0,
                mean_ns: 0,
                min_ns: 0,
                max_ns: 0
            }
        );
    }

    #[test]
    fn registry_scopes_names_by_alias() {
        let registry = MetricsRegistry::new();
        let a = registry.timer(&def("alpha"), "cycles");
        let b = registry.timer(&def("beta"), "cycles");
        a.update(5);
        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 0);
        assert!(registry.timer_snapshot("alpha.cycles").is_some());
        assert!(registry.timer_snapshot("beta.cycles").is_some());
        assert!(registry.timer_snapshot("gamma.cycles").is_none());
    }

    #[test]
    fn same_name_resolves_to_the_same_timer() {
        let registry = MetricsRegistry::new();
        let a = registry.timer(&def("x"), "strides");
        let b = registry.timer(&def("x"), "strides");
        a.update(7);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn gauges_read_through_the_closure() {
        let registry = MetricsRegistry::new();
        registry.gauge(&def("x"), "cco-delay-cycles", || 42);
        assert_eq!(registry.gauge_value("x.cco-delay-cycles"), Some(42));
        assert_eq!(registry.gauge_value("x.missing"), None);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let registry = MetricsRegistry::new();
        registry.timer(&def("x"), "cycles").update(100);
        registry.gauge(&def("x"), "cco-delay-cycles", || 3);
        let json = registry.to_json().unwrap();
        assert!(json.contains("x.cycles"));
        assert!(json.contains("x.cco-delay-cycles"));
    }
}
