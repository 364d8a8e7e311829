//! The concurrent cycle-progress tracker.
//!
//! A [`CoreTracker`] covers the interval `[min, max)` with a ring of
//! [`ByteTrackerExtent`]s. Writers mark per-cycle results as work
//! completes, in any order and from any thread; one or more consumers pull
//! [`CycleResultsSegment`]s that are always contiguous, in ascending cycle
//! order, and fully marked before delivery.
//!
//! Backpressure runs both ways: a writer marking beyond the resident
//! window blocks until the consumer drains a leading extent, and a
//! consumer blocks until enough contiguous cycles are marked (or the
//! tracker is flushed for shutdown).

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};
use typed_builder::TypedBuilder;

use super::extent::ByteTrackerExtent;
use super::{CycleResult, CycleResultsSegment};
use crate::action::Output;
use crate::error::{Error, Result};
use crate::motor::ops::OpContext;

#[derive(Debug, Clone, Copy, TypedBuilder)]
pub struct TrackerConfig {
    pub min: i64,
    pub max: i64,
    #[builder(default = 1024)]
    pub extent_size: usize,
    #[builder(default = 4)]
    pub extent_count: usize,
}

pub struct CoreTracker {
    min: i64,
    max: i64,
    extent_size: usize,
    state: Mutex<TrackerState>,
    /// Signaled when the write frontier advances past an extent boundary,
    /// and on flush.
    extent_ready: Condvar,
    /// Signaled when the consumer retires a leading extent, opening a ring
    /// slot for writers blocked past the window.
    slot_free: Condvar,
}

struct TrackerState {
    extents: VecDeque<ByteTrackerExtent>,
    /// Base cycle of the front extent; advances as extents retire.
    window_base: i64,
    /// Base of the next extent to admit into the ring.
    next_admit: i64,
    /// Next cycle the consumer will receive.
    read_cursor: i64,
    flushed: bool,
}

impl TrackerState {
    /// Cycles from the read cursor through the last consecutive fully
    /// marked extent. Only whole extents count toward contiguity: an
    /// extent with unmarked slots blocks everything behind it even if a
    /// later extent happens to be complete.
    fn contiguous_available(&self) -> i64 {
        let mut available = 0;
        let mut cursor = self.read_cursor;
        for extent in &self.extents {
            if !extent.is_fully_marked() {
                break;
            }
            available += extent.max_cycle() - cursor.max(extent.min_cycle());
            cursor = extent.max_cycle();
        }
        available
    }
}

impl CoreTracker {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        if config.max < config.min {
            return Err(Error::BadParameter {
                key: "max".to_string(),
                reason: format!("interval [{},{}) is inverted", config.min, config.max),
            });
        }
        if config.extent_size == 0 || config.extent_count == 0 {
            return Err(Error::BadParameter {
                key: "extent_size".to_string(),
                reason: "extent size and count must be positive".to_string(),
            });
        }
        let mut extents = VecDeque::with_capacity(config.extent_count);
        let mut next_admit = config.min;
        while extents.len() < config.extent_count && next_admit < config.max {
            let len = (config.extent_size as i64).min(config.max - next_admit) as usize;
            extents.push_back(ByteTrackerExtent::new(next_admit, len));
            next_admit += len as i64;
        }
        Ok(Self {
            min: config.min,
            max: config.max,
            extent_size: config.extent_size,
            state: Mutex::new(TrackerState {
                extents,
                window_base: config.min,
                next_admit,
                read_cursor: config.min,
                flushed: false,
            }),
            extent_ready: Condvar::new(),
            slot_free: Condvar::new(),
        })
    }

    pub fn min_cycle(&self) -> i64 {
        self.min
    }

    pub fn max_cycle(&self) -> i64 {
        self.max
    }

    /// Record the result for one cycle. Blocks while `cycle` lies beyond
    /// the resident window (ring full awaiting drain).
    pub fn mark_result(&self, cycle: i64, result: i32) -> Result<()> {
        if cycle < self.min || cycle >= self.max {
            return Err(Error::CycleOutOfBounds {
                cycle,
                min: self.min,
                max: self.max,
            });
        }
        let mut state = self.state.lock();
        while cycle >= state.next_admit {
            self.slot_free.wait(&mut state);
        }
        if cycle < state.window_base {
            return Err(Error::CycleMarkedTwice { cycle });
        }
        let index = ((cycle - state.window_base) / self.extent_size as i64) as usize;
        let completed = state.extents[index].mark_result(cycle, result)?;
        if completed {
            self.extent_ready.notify_all();
        }
        Ok(())
    }

    /// Pull the next `size` cycles of results, in ascending cycle order.
    ///
    /// Blocks until enough contiguous cycles are marked. Requests that
    /// reach past `max` are clipped to the tail of the interval. After
    /// [`flush`](Self::flush), residual marked cycles drain in sub-`size`
    /// segments; `None` means the tracker is fully drained.
    pub fn get_segment(&self, size: usize) -> Option<CycleResultsSegment> {
        let mut state = self.state.lock();
        loop {
            if state.read_cursor >= self.max {
                return None;
            }
            let want = (size as i64).min(self.max - state.read_cursor);
            let available = state.contiguous_available();
            if available >= want && want > 0 {
                return Some(self.extract(&mut state, want));
            }
            if state.flushed {
                return if available > 0 {
                    Some(self.extract(&mut state, available))
                } else {
                    None
                };
            }
            self.extent_ready.wait(&mut state);
        }
    }

    fn extract(&self, state: &mut TrackerState, count: i64) -> CycleResultsSegment {
        let mut results = Vec::with_capacity(count as usize);
        let mut freed = false;
        while (results.len() as i64) < count {
            let front = &state.extents[0];
            let cycle = state.read_cursor;
            results.push(CycleResult {
                cycle,
                result: front.result_at(cycle) as i32,
            });
            state.read_cursor += 1;
            if state.read_cursor >= front.max_cycle() {
                let retired = state.extents.pop_front();
                state.window_base += retired.map_or(0, |e| e.len() as i64);
                if state.next_admit < self.max {
                    let len = (self.extent_size as i64).min(self.max - state.next_admit) as usize;
                    state
                        .extents
                        .push_back(ByteTrackerExtent::new(state.next_admit, len));
                    state.next_admit += len as i64;
                }
                freed = true;
            }
        }
        if freed {
            self.slot_free.notify_all();
        }
        CycleResultsSegment::new(results)
    }

    /// Release any consumer waiting for more marks, so residual results can
    /// drain at shutdown.
    pub fn flush(&self) {
        let mut state = self.state.lock();
        state.flushed = true;
        tracing::debug!(
            read_cursor = state.read_cursor,
            "tracker flushed for drain"
        );
        drop(state);
        self.extent_ready.notify_all();
    }
}

impl Output for CoreTracker {
    fn on_cycle_result(
        &self,
        op: &OpContext,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.mark_result(op.cycle(), op.result())?;
        Ok(())
    }

    fn on_cycle_result_segment(
        &self,
        segment: &CycleResultsSegment,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for r in segment.iter() {
            self.mark_result(r.cycle, r.result)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn tracker(min: i64, max: i64, extent_size: usize, extent_count: usize) -> CoreTracker {
        CoreTracker::new(
            TrackerConfig::builder()
                .min(min)
                .max(max)
                .extent_size(extent_size)
                .extent_count(extent_count)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn marks_fill_a_single_extent() {
        let ct = tracker(0, 4, 4, 1);
        for c in 0..4 {
            ct.mark_result(c, c as i32).unwrap();
        }
        let seg = ct.get_segment(4).unwrap();
        let got: Vec<(i64, i32)> = seg.iter().map(|r| (r.cycle, r.result)).collect();
        assert_eq!(got, vec![(0, 0), (1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn ring_rotates_through_a_clipped_tail() {
        let ct = tracker(0, 11, 4, 2);
        for c in 0..4 {
            ct.mark_result(c, c as i32).unwrap();
        }
        // Without this read the next extent has no slot to rotate into.
        let first = ct.get_segment(4).unwrap();
        assert_eq!(first.len(), 4);
        for c in 4..8 {
            ct.mark_result(c, c as i32).unwrap();
        }
        let second = ct.get_segment(4).unwrap();
        assert_eq!(second.len(), 4);
        ct.flush();
        assert!(ct.get_segment(4).is_none());
    }

    #[test]
    fn rejects_marks_outside_the_interval() {
        let ct = tracker(0, 10, 4, 2);
        assert!(matches!(
            ct.mark_result(10, 0),
            Err(Error::CycleOutOfBounds { .. })
        ));
        assert!(matches!(
            ct.mark_result(-1, 0),
            Err(Error::CycleOutOfBounds { .. })
        ));
    }

    #[test]
    fn consumer_blocks_until_writer_catches_up() {
        let ct = Arc::new(tracker(0, 100, 10, 3));
        let reader = {
            let ct = Arc::clone(&ct);
            thread::spawn(move || {
                let mut segments = Vec::new();
                for _ in 0..100 {
                    segments.push(ct.get_segment(1).unwrap());
                }
                segments
            })
        };
        let writer = {
            let ct = Arc::clone(&ct);
            thread::spawn(move || {
                for c in 0..100 {
                    ct.mark_result(c, c as i32).unwrap();
                }
            })
        };
        writer.join().unwrap();
        let segments = reader.join().unwrap();
        assert_eq!(segments.len(), 100);
        for (i, seg) in segments.iter().enumerate() {
            assert_eq!(seg.len(), 1);
            assert_eq!(seg.iter().next().unwrap().cycle, i as i64);
        }
    }

    #[test]
    fn bulk_million_cycle_producer_consumer() {
        let max = 1_000_000;
        let ct = Arc::new(tracker(0, max, 100_000, 4));
        let reader = {
            let ct = Arc::clone(&ct);
            thread::spawn(move || {
                let mut count: i64 = 0;
                let mut expected: i64 = 0;
                while count < max {
                    let seg = ct.get_segment(1).unwrap();
                    for r in seg.iter() {
                        assert_eq!(r.cycle, expected);
                        expected += 1;
                        count += 1;
                    }
                }
                count
            })
        };
        let writer = {
            let ct = Arc::clone(&ct);
            thread::spawn(move || {
                for c in 0..max {
                    ct.mark_result(c, (c % 251) as i32).unwrap();
                }
            })
        };
        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), max);
    }

    #[test]
    fn out_of_order_marks_within_an_extent_gate_delivery() {
        let ct = Arc::new(tracker(0, 8, 4, 2));
        // Leave a hole at cycle 1; the consumer must not see anything yet.
        ct.mark_result(0, 0).unwrap();
        ct.mark_result(2, 0).unwrap();
        ct.mark_result(3, 0).unwrap();
        let ct2 = Arc::clone(&ct);
        let reader = thread::spawn(move || ct2.get_segment(4).unwrap());
        thread::sleep(std::time::Duration::from_millis(20));
        ct.mark_result(1, 9).unwrap();
        let seg = reader.join().unwrap();
        let cycles: Vec<i64> = seg.iter().map(|r| r.cycle).collect();
        assert_eq!(cycles, vec![0, 1, 2, 3]);
        assert_eq!(seg.iter().nth(1).unwrap().result, 9);
    }

    #[test]
    fn flush_drains_a_partial_tail() {
        let ct = tracker(0, 10, 4, 3);
        for c in 0..4 {
            ct.mark_result(c, 1).unwrap();
        }
        ct.flush();
        let seg = ct.get_segment(10).unwrap();
        assert_eq!(seg.len(), 4);
        assert!(ct.get_segment(10).is_none());
    }

    #[test]
    fn requests_clip_to_the_interval_tail() {
        let ct = tracker(0, 3, 4, 1);
        for c in 0..3 {
            ct.mark_result(c, 0).unwrap();
        }
        let seg = ct.get_segment(10).unwrap();
        assert_eq!(seg.len(), 3);
        assert!(ct.get_segment(1).is_none());
    }

    #[test]
    fn inverted_interval_is_rejected() {
        assert!(CoreTracker::new(
            TrackerConfig::builder().min(10).max(5).build()
        )
        .is_err());
    }
}
