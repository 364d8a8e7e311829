//! Action and output contracts — the seams user workloads plug into.
//!
//! Actions come in two shapes. A [`SyncAction`] processes one cycle in the
//! motor thread and returns its result code directly; it may additionally
//! advertise multi-phase work by overriding [`SyncAction::incomplete`]. An
//! [`AsyncAction`] accepts enqueued [`OpContext`]s and completes each one
//! later, from any thread, by calling [`OpContext::stop`] exactly once.

use std::time::Duration;

use crate::cycles::CycleResultsSegment;
use crate::motor::ops::OpContext;

/// Boxed error type surfaced by user-provided actions and outputs.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// A synchronous, per-cycle action.
pub trait SyncAction: Send {
    /// One-time setup before the motor starts iterating.
    fn init(&mut self) {}

    /// Process one cycle, returning a small non-negative result code
    /// (0 = success, >0 = workload-defined failure class).
    fn run_cycle(&mut self, cycle: i64) -> std::result::Result<i32, DynError>;

    /// Multi-phase capability: run one additional phase of the current
    /// cycle. Single-phase actions keep the defaults.
    fn run_phase(&mut self, cycle: i64) -> std::result::Result<i32, DynError> {
        self.run_cycle(cycle)
    }

    /// Whether the current cycle still has phases left to run.
    fn incomplete(&self) -> bool {
        false
    }
}

/// An asynchronous action: the motor enqueues op contexts without blocking
/// per cycle, and the action completes them on its own schedule.
pub trait AsyncAction: Send {
    /// One-time setup before the motor starts iterating.
    fn init(&mut self) {}

    /// Allocate the context for one operation.
    fn new_op_context(&mut self) -> OpContext {
        OpContext::new()
    }

    /// Accept an operation, or hand the context back when the queue is
    /// full. The action promises exactly one [`OpContext::stop`] call per
    /// accepted context.
    fn enqueue(&mut self, op: OpContext) -> std::result::Result<(), OpContext>;

    /// Block until every accepted operation has completed, or `timeout`
    /// elapses. Returns whether completion was reached.
    fn await_completion(&mut self, timeout: Duration) -> bool;

    /// Cooperative stop: give back queue capacity quickly, finish in-flight
    /// work.
    fn request_stop(&mut self) {}
}

/// The two action shapes a motor can drive.
pub enum Action {
    Sync(Box<dyn SyncAction>),
    Async(Box<dyn AsyncAction>),
}

impl Action {
    pub fn is_async(&self) -> bool {
        matches!(self, Action::Async(_))
    }
}

/// Sink for completed cycle results.
pub trait Output: Send + Sync {
    /// One completed operation, with its timing still attached.
    fn on_cycle_result(&self, op: &OpContext) -> std::result::Result<(), DynError>;

    /// A stride's worth of completed cycles, in ascending cycle order.
    fn on_cycle_result_segment(
        &self,
        segment: &CycleResultsSegment,
    ) -> std::result::Result<(), DynError>;
}
