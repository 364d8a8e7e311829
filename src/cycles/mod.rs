//! Cycle segments and result buffers.
//!
//! A *cycle* is a 64-bit sequence number identifying one unit of work.
//! Inputs hand cycles to motors in [`CycleSegment`] batches (one *stride*
//! at a time); completed work flows downstream as [`CycleResultsSegment`]
//! batches of `(cycle, result)` pairs, always in ascending cycle order.

pub mod extent;
pub mod input;
pub mod tracker;

pub use extent::ByteTrackerExtent;
pub use input::{AtomicInput, Input};
pub use tracker::{CoreTracker, TrackerConfig};

use serde::{Deserialize, Serialize};

/// Sentinel returned by [`CycleSegment::next_cycle`] once the segment is
/// consumed. Valid cycle numbers are non-negative.
pub const SEGMENT_EXHAUSTED: i64 = -1;

/// A finite, consumable run of cycle numbers `[first, first+len)`.
///
/// Segments are single-consumer: one motor thread drains a segment it was
/// issued and then discards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSegment {
    next: i64,
    end: i64,
}

impl CycleSegment {
    /// A segment spanning `[first, end)`.
    pub fn span(first: i64, end: i64) -> Self {
        Self {
            next: first,
            end: end.max(first),
        }
    }

    /// The next cycle this segment will yield, without consuming it.
    /// Returns [`SEGMENT_EXHAUSTED`] when nothing is left.
    pub fn peek_next_cycle(&self) -> i64 {
        if self.next < self.end {
            self.next
        } else {
            SEGMENT_EXHAUSTED
        }
    }

    /// Consume and return the next cycle, or [`SEGMENT_EXHAUSTED`].
    pub fn next_cycle(&mut self) -> i64 {
        if self.next < self.end {
            let cycle = self.next;
            self.next += 1;
            cycle
        } else {
            SEGMENT_EXHAUSTED
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.next >= self.end
    }

    /// Cycles remaining to be consumed.
    pub fn len(&self) -> usize {
        (self.end - self.next) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.is_exhausted()
    }
}

/// One completed cycle and its result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleResult {
    pub cycle: i64,
    pub result: i32,
}

/// An ordered batch of completed cycles, as delivered to outputs and by
/// the tracker to downstream consumers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleResultsSegment {
    results: Vec<CycleResult>,
}

impl CycleResultsSegment {
    pub fn new(results: Vec<CycleResult>) -> Self {
        Self { results }
    }

    pub fn iter(&self) -> impl Iterator<Item = &CycleResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

impl IntoIterator for CycleResultsSegment {
    type Item = CycleResult;
    type IntoIter = std::vec::IntoIter<CycleResult>;

    fn into_iter(self) -> Self::IntoIter {
        self.results.into_iter()
    }
}

/// Stride-local append buffer a motor fills while working through a
/// segment, then converts into a [`CycleResultsSegment`] for the output.
#[derive(Debug)]
pub struct CycleResultSegmentBuffer {
    results: Vec<CycleResult>,
}

impl CycleResultSegmentBuffer {
    pub fn new(stride: usize) -> Self {
        Self {
            results: Vec::with_capacity(stride),
        }
    }

    pub fn append(&mut self, cycle: i64, result: i32) {
        self.results.push(CycleResult { cycle, result });
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_reader(self) -> CycleResultsSegment {
        CycleResultsSegment::new(self.results)
    }
}
