//! Per-worker run-state cell.

use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of one motor slot.
///
/// ```text
/// Initialized → Starting → Running → Stopping → Stopped
///                               ↘ Finished (input exhausted)
///                               ↘ Errored  (fatal fault)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Initialized = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Stopped = 4,
    Finished = 5,
    Errored = 6,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Initialized,
            1 => RunState::Starting,
            2 => RunState::Running,
            3 => RunState::Stopping,
            4 => RunState::Stopped,
            5 => RunState::Finished,
            _ => RunState::Errored,
        }
    }

    pub fn can_transition_to(self, target: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, target),
            (Initialized, Starting)
                | (Starting, Running)
                | (Starting, Finished)
                | (Starting, Errored)
                | (Running, Stopping)
                | (Running, Finished)
                | (Running, Errored)
                | (Stopping, Stopped)
                | (Stopping, Errored)
        )
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Stopped | RunState::Finished | RunState::Errored)
    }
}

/// The atomic state cell for one motor slot. The owning motor drives the
/// state machine; other threads observe it and may request a stop.
/// Transitions are validated compare-and-swaps, so concurrent requests
/// cannot push a slot through an illegal edge.
pub struct SlotStateTracker {
    slot_id: usize,
    state: AtomicU8,
}

impl SlotStateTracker {
    pub fn new(slot_id: usize) -> Self {
        Self {
            slot_id,
            state: AtomicU8::new(RunState::Initialized as u8),
        }
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn get(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt the transition to `target`. Returns whether it took effect;
    /// illegal transitions are logged and refused.
    pub fn enter(&self, target: RunState) -> bool {
        loop {
            let current = self.get();
            if current == target {
                return true;
            }
            if !current.can_transition_to(target) {
                tracing::warn!(
                    slot = self.slot_id,
                    from = ?current,
                    to = ?target,
                    "refusing illegal slot state transition"
                );
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current as u8,
                    target as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::trace!(slot = self.slot_id, from = ?current, to = ?target, "slot state");
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_through_stop() {
        let slot = SlotStateTracker::new(0);
        assert_eq!(slot.get(), RunState::Initialized);
        assert!(slot.enter(RunState::Starting));
        assert!(slot.enter(RunState::Running));
        assert!(slot.enter(RunState::Stopping));
        assert!(slot.enter(RunState::Stopped));
        assert!(slot.get().is_terminal());
    }

    #[test]
    fn finish_is_terminal() {
        let slot = SlotStateTracker::new(1);
        slot.enter(RunState::Starting);
        slot.enter(RunState::Running);
        assert!(slot.enter(RunState::Finished));
        assert!(!slot.enter(RunState::Running));
        assert!(!slot.enter(RunState::Stopping));
        assert_eq!(slot.get(), RunState::Finished);
    }

    #[test]
    fn illegal_jumps_are_refused() {
        let slot = SlotStateTracker::new(2);
        assert!(!slot.enter(RunState::Running));
        assert!(!slot.enter(RunState::Stopped));
        assert_eq!(slot.get(), RunState::Initialized);
    }

    #[test]
    fn reentering_the_current_state_is_a_no_op() {
        let slot = SlotStateTracker::new(3);
        slot.enter(RunState::Starting);
        assert!(slot.enter(RunState::Starting));
        assert_eq!(slot.get(), RunState::Starting);
    }
}
