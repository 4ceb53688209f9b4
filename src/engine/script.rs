//! A small scripted engine used by the command-line front end and tests.
//!
//! Programs are sequences of control instructions, not a real instruction
//! set: they only move the instruction pointer, raise faults on demand and
//! halt.

use super::{Engine, StepOutcome};
use crate::fault::{EngineFault, FaultKind};
use crate::model::JobId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Instruction {
    Nop,
    Jump { target: usize },
    /// Raise `kind` without advancing, so re-stepping faults again.
    Fault { kind: FaultKind, detail: String },
    Halt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub instructions: Vec<Instruction>,
}

impl Program {
    pub fn new(instructions: Vec<Instruction>) -> Self {
        Self { instructions }
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
struct JobSlot {
    program: Option<Program>,
    ip: usize,
    retired: u64,
}

#[derive(Debug, Clone)]
pub struct ScriptEngine {
    jobs: Vec<JobSlot>,
    current: JobId,
}

impl ScriptEngine {
    pub fn new(job_count: usize) -> Self {
        Self {
            jobs: vec![JobSlot::default(); job_count.max(1)],
            current: 0,
        }
    }

    /// Install `program` into `job` with the instruction pointer at zero.
    pub fn install(&mut self, job: JobId, program: Program) {
        if let Some(slot) = self.jobs.get_mut(job) {
            *slot = JobSlot {
                program: Some(program),
                ip: 0,
                retired: 0,
            };
        }
    }

    pub fn program(&self, job: JobId) -> Option<&Program> {
        self.jobs.get(job).and_then(|s| s.program.as_ref())
    }

    /// Instructions retired by the active job since it was installed.
    pub fn retired(&self) -> u64 {
        self.jobs[self.current].retired
    }
}

impl Engine for ScriptEngine {
    fn step(&mut self) -> Result<StepOutcome, EngineFault> {
        let slot = &mut self.jobs[self.current];
        let program = slot.program.as_ref().ok_or_else(|| {
            EngineFault::new(FaultKind::MissingReference, "no program in the current job")
        })?;
        let instruction = program.instructions.get(slot.ip).ok_or_else(|| {
            EngineFault::new(
                FaultKind::CodeAccess,
                format!("instruction pointer {} outside code of length {}", slot.ip, program.len()),
            )
        })?;
        match instruction {
            Instruction::Nop => {
                slot.ip += 1;
            }
            Instruction::Jump { target } => {
                slot.ip = *target;
            }
            Instruction::Fault { kind, detail } => {
                return Err(EngineFault::new(*kind, detail.clone()));
            }
            Instruction::Halt => {
                slot.retired += 1;
                return Ok(StepOutcome::Halted);
            }
        }
        slot.retired += 1;
        Ok(StepOutcome::Continue)
    }

    fn instruction_pointer(&self) -> usize {
        self.jobs[self.current].ip
    }

    fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn current_job(&self) -> JobId {
        self.current
    }

    fn select_job(&mut self, job: JobId) {
        if job < self.jobs.len() {
            self.current = job;
        }
    }

    fn clear_job(&mut self) {
        self.jobs[self.current] = JobSlot::default();
    }
}
