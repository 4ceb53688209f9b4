mod script;

pub use script::{Instruction, Program, ScriptEngine};

use crate::fault::EngineFault;
use crate::model::JobId;

/// Result of one successful engine step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Instruction retired; more may follow.
    Continue,
    /// The program reached its halt condition.
    Halted,
}

/// The instruction-execution unit driven by the controller.
///
/// The controller never looks inside; it only steps, reads the instruction
/// pointer for fault reports and manages which job slot is active.
pub trait Engine: Send {
    fn step(&mut self) -> Result<StepOutcome, EngineFault>;

    fn instruction_pointer(&self) -> usize;

    fn job_count(&self) -> usize;

    fn current_job(&self) -> JobId;

    /// Make `job` the active slot. Callers check the index against
    /// [`Engine::job_count`] first.
    fn select_job(&mut self, job: JobId);

    /// Drop the program held by the active slot.
    fn clear_job(&mut self);
}
