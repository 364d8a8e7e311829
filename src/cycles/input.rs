//! Cycle inputs — where motors get their work from.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use super::CycleSegment;
use crate::activity::{ActivityDef, ActivityDefObserver};

/// Produces cycle segments of a requested stride for motor threads.
///
/// Returning `None` signals permanent exhaustion; motors transition their
/// slot to `Finished` when they see it.
pub trait Input: Send + Sync {
    fn next_segment(&self, stride: usize) -> Option<CycleSegment>;

    /// Called once by each motor before its first segment request.
    fn start(&self) {}

    /// Cooperative stop: after this, `next_segment` should return `None`.
    fn request_stop(&self) {}
}

/// The standard interval input: hands out contiguous segments over
/// `[min, max)` to any number of motor threads using a CAS claim loop, so
/// every cycle is issued exactly once with no per-claim locking.
pub struct AtomicInput {
    min: AtomicI64,
    max: AtomicI64,
    next: AtomicI64,
    stopping: AtomicBool,
}

impl AtomicInput {
    pub fn new(min: i64, max: i64) -> Self {
        Self {
            min: AtomicI64::new(min),
            max: AtomicI64::new(max.max(min)),
            next: AtomicI64::new(min),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn from_def(def: &ActivityDef) -> Self {
        let (min, max) = def.cycles();
        Self::new(min, max)
    }

    /// The first cycle not yet claimed by any motor.
    pub fn pending(&self) -> i64 {
        self.next.load(Ordering::Relaxed)
    }

    /// The configured `[min, max)` interval.
    pub fn interval(&self) -> (i64, i64) {
        (self.min.load(Ordering::Relaxed), self.max.load(Ordering::Relaxed))
    }
}

impl Input for AtomicInput {
    fn next_segment(&self, stride: usize) -> Option<CycleSegment> {
        let max = self.max.load(Ordering::Relaxed);
        loop {
            if self.stopping.load(Ordering::Relaxed) {
                return None;
            }
            let current = self.next.load(Ordering::Relaxed);
            if current >= max {
                return None;
            }
            let end = (current + stride as i64).min(max);
            if self
                .next
                .compare_exchange(current, end, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(CycleSegment::span(current, end));
            }
        }
    }

    fn request_stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }
}

impl ActivityDefObserver for AtomicInput {
    fn on_activity_def_update(&self, def: &ActivityDef) {
        let (min, max) = def.cycles();
        self.min.store(min, Ordering::Relaxed);
        self.max.store(max.max(min), Ordering::Relaxed);
        tracing::debug!(min, max, "input cycle interval updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn segments_cover_the_interval_without_overlap() {
        let input = AtomicInput::new(0, 10);
        let a = input.next_segment(4).unwrap();
        let b = input.next_segment(4).unwrap();
        let c = input.next_segment(4).unwrap();
        assert_eq!((a.peek_next_cycle(), a.len()), (0, 4));
        assert_eq!((b.peek_next_cycle(), b.len()), (4, 4));
        // Tail segment is clipped to the interval.
        assert_eq!((c.peek_next_cycle(), c.len()), (8, 2));
        assert!(input.next_segment(4).is_none());
    }

    #[test]
    fn definition_updates_retarget_the_interval() {
        let input = AtomicInput::from_def(&ActivityDef::parse("cycles=100").unwrap());
        assert_eq!(input.interval(), (0, 100));
        input.on_activity_def_update(&ActivityDef::parse("cycles=50..5000").unwrap());
        assert_eq!(input.interval(), (50, 5000));
        // Already-claimed position is kept; only the bounds move.
        assert_eq!(input.pending(), 0);
    }

    #[test]
    fn stop_request_ends_the_stream() {
        let input = AtomicInput::new(0, 1000);
        assert!(input.next_segment(10).is_some());
        input.request_stop();
        assert!(input.next_segment(10).is_none());
    }

    #[test]
    fn concurrent_claims_issue_every_cycle_once() {
        let input = Arc::new(AtomicInput::new(0, 10_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let input = Arc::clone(&input);
            handles.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(mut seg) = input.next_segment(17) {
                    loop {
                        let c = seg.next_cycle();
                        if c < 0 {
                            break;
                        }
                        seen.push(c);
                    }
                }
                seen
            }));
        }
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(all.len(), 10_000);
        let unique: HashSet<i64> = all.iter().copied().collect();
        assert_eq!(unique.len(), 10_000);
        all.sort_unstable();
        assert_eq!(all[0], 0);
        assert_eq!(*all.last().unwrap(), 9_999);
    }
}
