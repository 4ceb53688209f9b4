use crate::fault::FaultReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a job slot held by the engine.
pub type JobId = usize;

/// Lifecycle state of the currently selected job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunState {
    NoProgramLoaded,
    LoadedNotAutoStepping,
    AutoStepping,
    Halted,
}

impl RunState {
    pub const ALL: [RunState; 4] = [
        RunState::NoProgramLoaded,
        RunState::LoadedNotAutoStepping,
        RunState::AutoStepping,
        RunState::Halted,
    ];

    /// Whether `step`/`execute` may touch the engine in this state.
    pub fn can_step(self) -> bool {
        !matches!(self, RunState::NoProgramLoaded | RunState::Halted)
    }

    /// Operations a view may offer while this state is active.
    pub fn affordances(self) -> Affordances {
        match self {
            RunState::NoProgramLoaded => Affordances {
                assemble: true,
                load: true,
                clear: false,
                reload: false,
                toggle_auto_step: false,
                step: false,
                change_job: true,
            },
            RunState::LoadedNotAutoStepping => Affordances {
                assemble: true,
                load: true,
                clear: true,
                reload: true,
                toggle_auto_step: true,
                step: true,
                change_job: true,
            },
            RunState::AutoStepping => Affordances {
                assemble: false,
                load: false,
                clear: false,
                reload: false,
                toggle_auto_step: true,
                step: false,
                change_job: false,
            },
            RunState::Halted => Affordances {
                assemble: true,
                load: true,
                clear: true,
                reload: true,
                toggle_auto_step: false,
                step: false,
                change_job: true,
            },
        }
    }

    /// Parse a user-facing state name (`halted`, `loaded`, ...).
    pub fn parse(s: &str) -> Option<RunState> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "nothing" | "no-program" | "noprogramloaded" => Some(RunState::NoProgramLoaded),
            "loaded" | "ready" | "loadednotautostepping" => Some(RunState::LoadedNotAutoStepping),
            "auto" | "autostepping" => Some(RunState::AutoStepping),
            "halt" | "halted" => Some(RunState::Halted),
            _ => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::NoProgramLoaded => "no program loaded",
            RunState::LoadedNotAutoStepping => "loaded",
            RunState::AutoStepping => "auto-stepping",
            RunState::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// Per-state enablement of user operations, recomputed on every state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Affordances {
    pub assemble: bool,
    pub load: bool,
    pub clear: bool,
    pub reload: bool,
    pub toggle_auto_step: bool,
    /// Covers both single step and execute.
    pub step: bool,
    pub change_job: bool,
}

/// What triggered a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeCause {
    Started,
    Loaded,
    Stepped,
    AutoStepped,
    ExecuteCompleted,
    ExecuteCancelled,
    AutoStepToggled,
    StateForced,
    JobSelected,
    Cleared,
}

/// Controller-visible state at the moment a notification was published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: RunState,
    pub job: JobId,
    pub instruction_pointer: usize,
    pub auto_stepping: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub cause: ChangeCause,
    /// Open-ended tag; observers ignore values they do not know.
    #[serde(default)]
    pub tag: Option<String>,
    pub snapshot: Snapshot,
}

impl ChangeEvent {
    pub const CLEAR_TAG: &'static str = "Clear";
    pub const LOAD_TAG: &'static str = "Load";
    pub const RELOAD_TAG: &'static str = "Reload";

    pub fn is_clear(&self) -> bool {
        self.tag.as_deref() == Some(Self::CLEAR_TAG)
    }
}

/// Everything the controller emits to presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlEvent {
    Changed(ChangeEvent),
    Fault(FaultReport),
    Info(String),
}

/// Outcome of one execute run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub steps: u64,
    pub faults: u64,
    pub cancelled: bool,
    pub final_state: RunState,
}
