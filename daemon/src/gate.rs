//! Pauses mining while an important process (a game, a render job) is running

use crate::supervisor::DesiredState;

pub const PAUSED_MESSAGE: &str = "Important process detected - mining is now paused.";
pub const RESUMED_MESSAGE: &str =
    "Important process has completed. Normal mining behavior will now resume.";

/// Operator requests pass straight through unless a pause is in effect, in which
/// case they are remembered and applied when the pause ends.
#[derive(Debug, Clone, Default)]
pub struct MiningGate {
    requested: DesiredState,
    paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub apply: Option<DesiredState>,
    pub message: &'static str,
}

impl MiningGate {
    pub fn new(initial: DesiredState) -> Self {
        Self { requested: initial, paused: false }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn requested(&self) -> DesiredState {
        self.requested
    }

    /// Record an operator request; returns the state to apply now, if any.
    pub fn request(&mut self, state: DesiredState) -> Option<DesiredState> {
        self.requested = state;
        (!self.paused).then_some(state)
    }

    /// Feed the latest detection result; returns a transition on each edge.
    pub fn observe(&mut self, detected: bool) -> Option<Transition> {
        match (self.paused, detected) {
            (false, true) => {
                self.paused = true;
                Some(Transition { apply: Some(DesiredState::Stopped), message: PAUSED_MESSAGE })
            }
            (true, false) => {
                self.paused = false;
                let apply = (self.requested != DesiredState::Unknown).then_some(self.requested);
                Some(Transition { apply, message: RESUMED_MESSAGE })
            }
            _ => None,
        }
    }
}
