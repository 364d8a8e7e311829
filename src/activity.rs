//! Activity definitions — the key/value configuration surface of an
//! activity, and the shared state its motors run against.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;
use crate::rates::{create_or_update, RateLimiter, RateSpec};

/// Parameter keys with engine-defined meaning. Anything else is passed
/// through untouched for actions to interpret.
const RATE_KEYS: [&str; 3] = ["cyclerate", "striderate", "phaserate"];

/// An activity definition: an ordered `key=value` map with typed accessors
/// for the keys the engine recognizes.
///
/// | Key | Effect |
/// |-----|--------|
/// | `alias` | Identifier used in metric names. |
/// | `threads` | Number of motor threads (spawned by the caller). |
/// | `stride` | Cycles per segment acquisition. |
/// | `async` | Declares the action asynchronous. |
/// | `cycles` | Cycle interval, `N` or `min..max`. |
/// | `cyclerate`, `striderate`, `phaserate` | `"<ops/s>[,<strictness>[,co]]"`. |
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityDef {
    params: BTreeMap<String, String>,
}

impl ActivityDef {
    /// Parse a `key=value;key=value` definition string, validating every
    /// recognized key eagerly so later accessors cannot fail.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut def = ActivityDef::default();
        for field in spec.split(';').map(str::trim).filter(|f| !f.is_empty()) {
            let (key, value) = field.split_once('=').ok_or_else(|| Error::BadParameter {
                key: field.to_string(),
                reason: "expected key=value".to_string(),
            })?;
            def.set_param(key.trim(), value.trim())?;
        }
        Ok(def)
    }

    /// Set one parameter, validating recognized keys.
    pub fn set_param(&mut self, key: &str, value: &str) -> Result<()> {
        let bad = |reason: &str| Error::BadParameter {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        match key {
            "threads" | "stride" => {
                let parsed: usize = value.parse().map_err(|_| bad("not a positive integer"))?;
                if parsed == 0 {
                    return Err(bad("must be at least 1"));
                }
            }
            "cycles" => {
                Self::parse_cycles(value).ok_or_else(|| bad("expected N or min..max"))?;
            }
            k if RATE_KEYS.contains(&k) => {
                value.parse::<RateSpec>()?;
            }
            _ => {}
        }
        self.params.insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn get_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn alias(&self) -> &str {
        self.get_param("alias").unwrap_or("unnamed")
    }

    pub fn threads(&self) -> usize {
        self.get_param("threads")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(num_cpus::get)
    }

    pub fn stride(&self) -> usize {
        self.get_param("stride").and_then(|v| v.parse().ok()).unwrap_or(1)
    }

    /// Whether the definition asserts an async action. Providing this for a
    /// sync action is a configuration error the motor reports at startup.
    pub fn is_async(&self) -> bool {
        self.params.contains_key("async")
    }

    fn parse_cycles(value: &str) -> Option<(i64, i64)> {
        if let Some((min, max)) = value.split_once("..") {
            let min = min.trim().parse().ok()?;
            let max = max.trim().parse().ok()?;
            (max >= min).then_some((min, max))
        } else {
            let max = value.trim().parse().ok()?;
            (max >= 0).then_some((0, max))
        }
    }

    /// The cycle interval `[min, max)`. `cycles=N` means `[0, N)`;
    /// the default is a single cycle.
    pub fn cycles(&self) -> (i64, i64) {
        self.get_param("cycles")
            .and_then(Self::parse_cycles)
            .unwrap_or((0, 1))
    }

    /// The rate spec under `key`, if one is configured.
    pub fn rate_spec(&self, key: &str) -> Option<RateSpec> {
        self.get_param(key).and_then(|v| v.parse().ok())
    }
}

/// Implemented by components that react to online definition changes
/// (inputs rescaling their interval, and so on). Motors and rate limiters
/// pick up changes through their own channels: motors re-read the stride at
/// stride boundaries, limiters are updated in place.
pub trait ActivityDefObserver: Send + Sync {
    fn on_activity_def_update(&self, def: &ActivityDef);
}

/// The shared substrate of one activity: its (mutable) definition, the
/// metrics registry, and the rate limiters all motors of the activity
/// throttle against.
pub struct Activity {
    def: Arc<RwLock<ActivityDef>>,
    metrics: MetricsRegistry,
    cycle_limiter: Option<Arc<dyn RateLimiter>>,
    stride_limiter: Option<Arc<dyn RateLimiter>>,
    phase_limiter: Option<Arc<dyn RateLimiter>>,
    observers: Mutex<Vec<Arc<dyn ActivityDefObserver>>>,
}

impl Activity {
    pub fn new(def: ActivityDef, metrics: MetricsRegistry) -> Result<Self> {
        let mut activity = Self {
            def: Arc::new(RwLock::new(def)),
            metrics,
            cycle_limiter: None,
            stride_limiter: None,
            phase_limiter: None,
            observers: Mutex::new(Vec::new()),
        };
        activity.rebuild_limiters()?;
        Ok(activity)
    }

    fn rebuild_limiters(&mut self) -> Result<()> {
        let def = self.def.read().clone();
        for (key, label) in [
            ("cyclerate", "cycles"),
            ("striderate", "strides"),
            ("phaserate", "phases"),
        ] {
            if let Some(spec) = def.rate_spec(key) {
                let existing = match label {
                    "cycles" => self.cycle_limiter.take(),
                    "strides" => self.stride_limiter.take(),
                    _ => self.phase_limiter.take(),
                };
                let limiter = create_or_update(&self.metrics, &def, label, existing, spec)?;
                match label {
                    "cycles" => self.cycle_limiter = Some(limiter),
                    "strides" => self.stride_limiter = Some(limiter),
                    _ => self.phase_limiter = Some(limiter),
                }
            }
        }
        Ok(())
    }

    /// Apply a `key=value;…` fragment to the live definition: limiters are
    /// retuned in place and observers are notified. Running motors pick up
    /// stride changes at their next stride boundary.
    pub fn apply_params(&mut self, fragment: &str) -> Result<()> {
        {
            let mut def = self.def.write();
            for field in fragment.split(';').map(str::trim).filter(|f| !f.is_empty()) {
                let (key, value) = field.split_once('=').ok_or_else(|| Error::BadParameter {
                    key: field.to_string(),
                    reason: "expected key=value".to_string(),
                })?;
                def.set_param(key.trim(), value.trim())?;
            }
        }
        self.rebuild_limiters()?;
        let def = self.def.read().clone();
        for observer in self.observers.lock().iter() {
            observer.on_activity_def_update(&def);
        }
        tracing::info!(alias = def.alias(), fragment, "activity definition updated");
        Ok(())
    }

    pub fn add_observer(&self, observer: Arc<dyn ActivityDefObserver>) {
        self.observers.lock().push(observer);
    }

    /// A snapshot of the current definition.
    pub fn def(&self) -> ActivityDef {
        self.def.read().clone()
    }

    /// The live, shared definition cell (motors re-read it per stride).
    pub fn def_handle(&self) -> Arc<RwLock<ActivityDef>> {
        Arc::clone(&self.def)
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    pub fn cycle_limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        self.cycle_limiter.clone()
    }

    pub fn stride_limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        self.stride_limiter.clone()
    }

    pub fn phase_limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        self.phase_limiter.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_recognized_keys() {
        let def =
            ActivityDef::parse("alias=demo;threads=4;stride=10;cycles=0..1000;cyclerate=500,1.0")
                .unwrap();
        assert_eq!(def.alias(), "demo");
        assert_eq!(def.threads(), 4);
        assert_eq!(def.stride(), 10);
        assert_eq!(def.cycles(), (0, 1000));
        let spec = def.rate_spec("cyclerate").unwrap();
        assert_eq!(spec.ops_per_sec, 500.0);
        assert_eq!(spec.strictness, 1.0);
    }

    #[test]
    fn defaults_apply_when_keys_are_absent() {
        let def = ActivityDef::parse("alias=min").unwrap();
        assert_eq!(def.stride(), 1);
        assert_eq!(def.threads(), num_cpus::get());
        assert_eq!(def.cycles(), (0, 1));
        assert!(!def.is_async());
        assert!(def.rate_spec("cyclerate").is_none());
    }

    #[test]
    fn cycles_accepts_count_and_interval_forms() {
        let def = ActivityDef::parse("cycles=250").unwrap();
        assert_eq!(def.cycles(), (0, 250));
        let def = ActivityDef::parse("cycles=100..300").unwrap();
        assert_eq!(def.cycles(), (100, 300));
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(ActivityDef::parse("threads=zero").is_err());
        assert!(ActivityDef::parse("stride=0").is_err());
        assert!(ActivityDef::parse("cycles=9..3").is_err());
        assert!(ActivityDef::parse("cyclerate=-5").is_err());
        assert!(ActivityDef::parse("naked").is_err());
    }

    #[test]
    fn unrecognized_keys_pass_through() {
        let def = ActivityDef::parse("alias=x;payload=/tmp/data.bin").unwrap();
        assert_eq!(def.get_param("payload"), Some("/tmp/data.bin"));
    }

    #[test]
    fn activity_builds_configured_limiters() {
        let def = ActivityDef::parse("alias=a;cyclerate=1000;striderate=100").unwrap();
        let activity = Activity::new(def, MetricsRegistry::new()).unwrap();
        assert!(activity.cycle_limiter().is_some());
        assert!(activity.stride_limiter().is_some());
        assert!(activity.phase_limiter().is_none());
    }

    #[test]
    fn apply_params_retunes_limiters_in_place() {
        let def = ActivityDef::parse("alias=a;cyclerate=1000").unwrap();
        let mut activity = Activity::new(def, MetricsRegistry::new()).unwrap();
        let limiter = activity.cycle_limiter().unwrap();
        activity.apply_params("cyclerate=2500").unwrap();
        // Same limiter instance, new rate.
        assert_eq!(limiter.rate(), 2500.0);
        assert!(Arc::ptr_eq(&limiter, &activity.cycle_limiter().unwrap()));
    }

    #[test]
    fn observers_see_definition_updates() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counting(AtomicUsize);
        impl ActivityDefObserver for Counting {
            fn on_activity_def_update(&self, _def: &ActivityDef) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut activity =
            Activity::new(ActivityDef::parse("alias=a").unwrap(), MetricsRegistry::new()).unwrap();
        let observer = Arc::new(Counting(AtomicUsize::new(0)));
        activity.add_observer(observer.clone());
        activity.apply_params("stride=20").unwrap();
        assert_eq!(observer.0.load(Ordering::Relaxed), 1);
    }
}
