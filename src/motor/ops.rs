//! Operation contexts and stride-level completion tracking for async
//! actions.
//!
//! The motor allocates one [`OpContext`] per cycle and enqueues it into the
//! action. The action completes each context — from any thread, in any
//! order — by calling [`OpContext::stop`], which consumes the context, so a
//! second completion is unrepresentable. Completed contexts funnel into the
//! stride's [`StrideTracker`]; when the last expected op lands, the tracker
//! reorders the stride into cycle order and feeds it to the output.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use crate::action::Output;
use crate::metrics::Timer;
use crate::motor::slot::{RunState, SlotStateTracker};
use crate::rates::monotonic_nanos;

/// Per-operation context handed to an async action.
pub struct OpContext {
    cycle: i64,
    wait_time: i64,
    started_at: i64,
    stopped_at: i64,
    result: i32,
    sink: Option<Arc<StrideTracker>>,
}

impl OpContext {
    pub fn new() -> Self {
        Self {
            cycle: 0,
            wait_time: 0,
            started_at: monotonic_nanos(),
            stopped_at: 0,
            result: 0,
            sink: None,
        }
    }

    pub fn set_cycle(&mut self, cycle: i64) -> &mut Self {
        self.cycle = cycle;
        self
    }

    /// Scheduling delay the rate limiter attributed to this op; counted
    /// into its final response time.
    pub fn set_wait_time(&mut self, nanos: i64) -> &mut Self {
        self.wait_time = nanos;
        self
    }

    pub fn add_sink(&mut self, sink: Arc<StrideTracker>) -> &mut Self {
        self.sink = Some(sink);
        self
    }

    pub fn cycle(&self) -> i64 {
        self.cycle
    }

    pub fn result(&self) -> i32 {
        self.result
    }

    /// Service time plus the scheduling wait, in nanoseconds. Only valid
    /// after the context was stopped.
    pub fn final_response_time(&self) -> i64 {
        (self.stopped_at - self.started_at) + self.wait_time
    }

    /// Complete this operation with `result`. Consuming `self` makes the
    /// exactly-once contract structural. The completed context is forwarded
    /// to the stride tracker, if one was attached.
    pub fn stop(mut self, result: i32) {
        self.stopped_at = monotonic_nanos();
        self.result = result;
        if let Some(sink) = self.sink.take() {
            sink.on_op_stop(self);
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Collects the completions of one stride.
///
/// Completions arrive lock-free on a queue; a counter detects when the
/// stride is whole. The final completer (or the sealing motor, whichever
/// comes last) drains the queue, restores cycle order, updates the stride
/// timer, and emits to the output. An output fault marks the slot Errored.
pub struct StrideTracker {
    first_cycle: i64,
    stride_delay: i64,
    started_at: i64,
    completed: SegQueue<OpContext>,
    completions: AtomicUsize,
    /// Number of ops actually enqueued; `usize::MAX` until sealed.
    expected: AtomicUsize,
    dispatched: AtomicBool,
    cycles_timer: Arc<Timer>,
    strides_timer: Arc<Timer>,
    output: Option<Arc<dyn Output>>,
    slot: Arc<SlotStateTracker>,
}

impl StrideTracker {
    pub fn new(
        first_cycle: i64,
        stride_delay: i64,
        cycles_timer: Arc<Timer>,
        strides_timer: Arc<Timer>,
        output: Option<Arc<dyn Output>>,
        slot: Arc<SlotStateTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            first_cycle,
            stride_delay,
            started_at: monotonic_nanos(),
            completed: SegQueue::new(),
            completions: AtomicUsize::new(0),
            expected: AtomicUsize::new(usize::MAX),
            dispatched: AtomicBool::new(false),
            cycles_timer,
            strides_timer,
            output,
            slot,
        })
    }

    /// Fix the number of ops this stride actually enqueued. Called by the
    /// motor once the stride's segment is drained (or cut short by a stop).
    pub fn seal(&self, expected: usize) {
        self.expected.store(expected, Ordering::SeqCst);
        if self.completions.load(Ordering::SeqCst) >= expected {
            self.dispatch();
        }
    }

    pub fn completed_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    fn on_op_stop(&self, op: OpContext) {
        self.cycles_timer.update(op.final_response_time());
        self.completed.push(op);
        let done = self.completions.fetch_add(1, Ordering::SeqCst) + 1;
        if done >= self.expected.load(Ordering::SeqCst) {
            self.dispatch();
        }
    }

    fn dispatch(&self) {
        if self.dispatched.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut ops = Vec::with_capacity(self.completions.load(Ordering::SeqCst));
        while let Some(op) = self.completed.pop() {
            ops.push(op);
        }
        ops.sort_by_key(|op| op.cycle());
        self.strides_timer
            .update((monotonic_nanos() - self.started_at) + self.stride_delay);
        tracing::trace!(first_cycle = self.first_cycle, ops = ops.len(), "stride complete");
        if let Some(output) = &self.output {
            for op in &ops {
                if let Err(e) = output.on_cycle_result(op) {
                    tracing::error!(
                        cycle = op.cycle(),
                        error = %e,
                        "error while feeding cycle result to output"
                    );
                    self.slot.enter(RunState::Errored);
                    return;
                }
            }
        }
    }
}
