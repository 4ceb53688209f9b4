//! Run-state machine with per-state entry actions.

use crate::model::{Affordances, RunState};
use tracing::debug;

type EnterHook = Box<dyn FnMut(RunState, &Affordances) + Send>;

/// Holds the active [`RunState`] and runs its entry action on every
/// transition. Legality of operations is the controller's business; the
/// machine accepts every transition.
pub struct StateMachine {
    current: RunState,
    affordances: Affordances,
    hooks: Vec<EnterHook>,
    entries: u64,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("current", &self.current)
            .field("affordances", &self.affordances)
            .field("hooks", &self.hooks.len())
            .field("entries", &self.entries)
            .finish()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(RunState::NoProgramLoaded)
    }
}

impl StateMachine {
    /// Create a machine sitting in `initial`. The entry action has not run yet.
    pub fn new(initial: RunState) -> Self {
        Self {
            current: initial,
            affordances: initial.affordances(),
            hooks: Vec::new(),
            entries: 0,
        }
    }

    pub fn current(&self) -> RunState {
        self.current
    }

    pub fn affordances(&self) -> Affordances {
        self.affordances
    }

    /// Number of entry actions run so far.
    pub fn entries(&self) -> u64 {
        self.entries
    }

    /// Register a hook called with the new state on every entry.
    pub fn on_enter<F>(&mut self, hook: F)
    where
        F: FnMut(RunState, &Affordances) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Replace the current state and run its entry action once.
    pub fn transition_to(&mut self, state: RunState) {
        if state != self.current {
            debug!(from = ?self.current, to = ?state, "run state transition");
        }
        self.current = state;
        self.enter();
    }

    /// Re-run the entry action of the current state.
    pub fn enter(&mut self) {
        self.affordances = self.current.affordances();
        self.entries += 1;
        let state = self.current;
        let affordances = self.affordances;
        for hook in self.hooks.iter_mut() {
            hook(state, &affordances);
        }
    }
}
