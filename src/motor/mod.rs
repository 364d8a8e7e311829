//! The motor — the per-thread iteration harness.
//!
//! Each motor owns one slot of an activity: it pulls cycle segments from
//! the shared input, throttles against the activity's stride/cycle/phase
//! rate limiters, dispatches cycles into the action, and pushes results to
//! the output, updating the `cycles`/`phases`/`strides`/`read_input`
//! timers as it goes. Sync and async actions take separate paths through
//! the loop; the async path never blocks per cycle outside the rate
//! limiter.
//!
//! A motor runs until its input is exhausted (`Finished`), a stop is
//! requested through its [`MotorHandle`] (`Stopping` → `Stopped`), or a
//! fault surfaces from the action or output (`Errored`).

pub mod ops;
pub mod slot;

pub use ops::{OpContext, StrideTracker};
pub use slot::{RunState, SlotStateTracker};

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::RwLock;

use crate::action::{Action, AsyncAction, Output, SyncAction};
use crate::activity::{Activity, ActivityDef};
use crate::cycles::{CycleResultSegmentBuffer, CycleSegment, Input};
use crate::error::{Error, Result};
use crate::metrics::{MetricsRegistry, Timer};
use crate::rates::{monotonic_nanos, RateLimiter};

/// How long an async motor waits out in-flight ops at shutdown.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(60);

/// One worker slot of an activity.
pub struct CoreMotor {
    slot_id: usize,
    input: Arc<dyn Input>,
    action: Action,
    output: Option<Arc<dyn Output>>,
    stride_limiter: Option<Arc<dyn RateLimiter>>,
    cycle_limiter: Option<Arc<dyn RateLimiter>>,
    phase_limiter: Option<Arc<dyn RateLimiter>>,
    def: Arc<RwLock<ActivityDef>>,
    metrics: MetricsRegistry,
    slot: Arc<SlotStateTracker>,
}

/// Observation and control surface for a running motor. Obtained before
/// the motor thread is spawned; shareable across threads.
#[derive(Clone)]
pub struct MotorHandle {
    slot: Arc<SlotStateTracker>,
    input: Arc<dyn Input>,
}

impl MotorHandle {
    pub fn slot_id(&self) -> usize {
        self.slot.slot_id()
    }

    pub fn state(&self) -> RunState {
        self.slot.get()
    }

    /// Cooperative stop. Only meaningful from `Running`; anything else is
    /// a no-op (with a warning for states that should never see one).
    pub fn request_stop(&self) {
        match self.slot.get() {
            RunState::Running => {
                self.input.request_stop();
                self.slot.enter(RunState::Stopping);
            }
            RunState::Stopping | RunState::Stopped => {}
            other => {
                tracing::warn!(
                    slot = self.slot.slot_id(),
                    state = ?other,
                    "attempted to stop motor from non-running state"
                );
            }
        }
    }
}

impl CoreMotor {
    /// A motor wired to an activity's shared limiters, definition and
    /// metrics.
    pub fn new(slot_id: usize, input: Arc<dyn Input>, action: Action, activity: &Activity) -> Self {
        Self {
            slot_id,
            input,
            action,
            output: None,
            stride_limiter: activity.stride_limiter(),
            cycle_limiter: activity.cycle_limiter(),
            phase_limiter: activity.phase_limiter(),
            def: activity.def_handle(),
            metrics: activity.metrics().clone(),
            slot: Arc::new(SlotStateTracker::new(slot_id)),
        }
    }

    pub fn set_output(&mut self, output: Arc<dyn Output>) -> &mut Self {
        self.output = Some(output);
        self
    }

    pub fn handle(&self) -> MotorHandle {
        MotorHandle {
            slot: Arc::clone(&self.slot),
            input: Arc::clone(&self.input),
        }
    }

    /// Drive the motor to a terminal state. Runs in the calling thread;
    /// callers wanting parallelism spawn one thread per motor.
    pub fn run(self) -> RunState {
        let slot = Arc::clone(&self.slot);
        let slot_id = self.slot_id;
        if let Err(e) = self.execute() {
            tracing::error!(slot = slot_id, error = %e, "error in core motor loop");
            slot.enter(RunState::Errored);
        }
        slot.get()
    }

    fn execute(self) -> Result<()> {
        let def = self.def.read().clone();
        let rig = MotorRig {
            slot_id: self.slot_id,
            input: self.input,
            output: self.output,
            stride_limiter: self.stride_limiter,
            cycle_limiter: self.cycle_limiter,
            phase_limiter: self.phase_limiter,
            def: self.def,
            slot: self.slot,
            cycles_timer: self.metrics.timer(&def, "cycles"),
            phases_timer: self.metrics.timer(&def, "phases"),
            strides_timer: self.metrics.timer(&def, "strides"),
            input_timer: self.metrics.timer(&def, "read_input"),
        };
        let mut action = self.action;

        rig.slot.enter(RunState::Starting);
        for limiter in [&rig.stride_limiter, &rig.cycle_limiter, &rig.phase_limiter]
            .into_iter()
            .flatten()
        {
            limiter.start();
        }
        rig.input.start();

        match &mut action {
            Action::Sync(action) => {
                if def.is_async() {
                    return Err(Error::AsyncParamOnSyncAction);
                }
                action.init();
                rig.slot.enter(RunState::Running);
                rig.run_sync(action.as_mut())
            }
            Action::Async(action) => {
                action.init();
                rig.slot.enter(RunState::Running);
                rig.run_async(action.as_mut())
            }
        }
    }
}

/// Everything the motor loop needs, separated from the action so the two
/// can be borrowed independently.
struct MotorRig {
    slot_id: usize,
    input: Arc<dyn Input>,
    output: Option<Arc<dyn Output>>,
    stride_limiter: Option<Arc<dyn RateLimiter>>,
    cycle_limiter: Option<Arc<dyn RateLimiter>>,
    phase_limiter: Option<Arc<dyn RateLimiter>>,
    def: Arc<RwLock<ActivityDef>>,
    slot: Arc<SlotStateTracker>,
    cycles_timer: Arc<Timer>,
    phases_timer: Arc<Timer>,
    strides_timer: Arc<Timer>,
    input_timer: Arc<Timer>,
}

impl MotorRig {
    /// Stride is re-read per segment so online definition changes take
    /// effect at the next stride boundary.
    fn stride(&self) -> usize {
        self.def.read().stride()
    }

    fn next_segment(&self) -> Option<CycleSegment> {
        let begin = monotonic_nanos();
        let segment = self.input.next_segment(self.stride());
        self.input_timer.update(monotonic_nanos() - begin);
        segment
    }

    fn acquire(limiter: &Option<Arc<dyn RateLimiter>>) -> i64 {
        limiter.as_ref().map_or(0, |rl| rl.acquire())
    }

    fn run_sync(&self, action: &mut dyn SyncAction) -> Result<()> {
        while self.slot.get() == RunState::Running {
            let Some(mut segment) = self.next_segment() else {
                tracing::debug!(slot = self.slot_id, "input exhausted, stopping motor thread");
                self.slot.enter(RunState::Finished);
                continue;
            };
            let stride_delay = Self::acquire(&self.stride_limiter);
            let mut buffer = CycleResultSegmentBuffer::new(segment.len());
            let stride_begin = monotonic_nanos();

            let stride_outcome: Result<()> = (|| {
                while !segment.is_exhausted() {
                    let cycle = segment.next_cycle();
                    if cycle < 0 {
                        if segment.is_exhausted() {
                            self.slot.enter(RunState::Finished);
                        }
                        continue;
                    }
                    if self.slot.get() != RunState::Running {
                        tracing::trace!(slot = self.slot_id, cycle, "motor stopped mid-stride");
                        break;
                    }
                    let cycle_delay = Self::acquire(&self.cycle_limiter);
                    let cycle_begin = monotonic_nanos();
                    let outcome = self.run_cycle_with_phases(action, cycle);
                    self.cycles_timer
                        .update((monotonic_nanos() - cycle_begin) + cycle_delay);
                    buffer.append(cycle, outcome?);
                }
                Ok(())
            })();
            self.strides_timer
                .update((monotonic_nanos() - stride_begin) + stride_delay);
            stride_outcome?;

            if let Some(output) = &self.output {
                if !buffer.is_empty() {
                    let segment = buffer.into_reader();
                    output.on_cycle_result_segment(&segment).map_err(|source| {
                        tracing::error!(
                            slot = self.slot_id,
                            error = %source,
                            "error while feeding result segment to output"
                        );
                        Error::Output { source }
                    })?;
                }
            }
        }
        if self.slot.get() == RunState::Stopping {
            self.slot.enter(RunState::Stopped);
        }
        Ok(())
    }

    fn run_cycle_with_phases(&self, action: &mut dyn SyncAction, cycle: i64) -> Result<i32> {
        let wrap = |source| {
            tracing::error!(cycle, "error while processing cycle");
            Error::Action { cycle, source }
        };

        let phase_begin = monotonic_nanos();
        let phase_delay = Self::acquire(&self.phase_limiter);
        let mut result = action.run_cycle(cycle).map_err(wrap)?;
        self.phases_timer
            .update((monotonic_nanos() - phase_begin) + phase_delay);

        while action.incomplete() {
            let phase_begin = monotonic_nanos();
            let phase_delay = Self::acquire(&self.phase_limiter);
            result = action.run_phase(cycle).map_err(wrap)?;
            self.phases_timer
                .update((monotonic_nanos() - phase_begin) + phase_delay);
        }
        Ok(result)
    }

    fn run_async(&self, action: &mut dyn AsyncAction) -> Result<()> {
        while self.slot.get() == RunState::Running {
            let Some(mut segment) = self.next_segment() else {
                tracing::debug!(slot = self.slot_id, "input exhausted, stopping motor thread");
                self.slot.enter(RunState::Finished);
                continue;
            };
            let stride_delay = Self::acquire(&self.stride_limiter);
            let tracker = StrideTracker::new(
                segment.peek_next_cycle(),
                stride_delay,
                Arc::clone(&self.cycles_timer),
                Arc::clone(&self.strides_timer),
                self.output.clone(),
                Arc::clone(&self.slot),
            );
            let mut enqueued = 0usize;

            'stride: while !segment.is_exhausted() && self.slot.get() == RunState::Running {
                let cycle = segment.next_cycle();
                if cycle < 0 {
                    if segment.is_exhausted() {
                        self.slot.enter(RunState::Finished);
                    }
                    continue;
                }
                let cycle_delay = Self::acquire(&self.cycle_limiter);
                let mut op = action.new_op_context();
                op.set_wait_time(cycle_delay)
                    .set_cycle(cycle)
                    .add_sink(Arc::clone(&tracker));

                // Queue-full is backpressure, not an error: retry until the
                // action accepts the op or the motor is asked to stop.
                let mut pending = op;
                loop {
                    match action.enqueue(pending) {
                        Ok(()) => {
                            enqueued += 1;
                            break;
                        }
                        Err(returned) => {
                            tracing::trace!(cycle, "action queue full, backing off");
                            if self.slot.get() != RunState::Running {
                                break 'stride;
                            }
                            thread::yield_now();
                            pending = returned;
                        }
                    }
                }
            }
            tracker.seal(enqueued);
        }

        match self.slot.get() {
            RunState::Finished => {
                if action.await_completion(COMPLETION_TIMEOUT) {
                    tracing::debug!(slot = self.slot_id, "slot completed successfully");
                } else {
                    tracing::warn!(
                        slot = self.slot_id,
                        "slot was stopped before completing successfully"
                    );
                }
            }
            RunState::Stopping => {
                action.request_stop();
                if !action.await_completion(COMPLETION_TIMEOUT) {
                    tracing::warn!(
                        slot = self.slot_id,
                        "outstanding async ops abandoned at stop"
                    );
                }
                self.slot.enter(RunState::Stopped);
            }
            _ => {}
        }
        Ok(())
    }
}
