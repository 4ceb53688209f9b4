//! Engine fault taxonomy and the classifier that turns a fault into a
//! displayable report.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// Control transferred outside the loaded code region.
    CodeAccess,
    /// Memory access outside the data bounds.
    DataAccess,
    /// Use of an unset or absent value.
    MissingReference,
    /// An instruction argument violates its contract.
    MalformedInstruction,
    DivideByZero,
}

impl FaultKind {
    pub const ALL: [FaultKind; 5] = [
        FaultKind::CodeAccess,
        FaultKind::DataAccess,
        FaultKind::MissingReference,
        FaultKind::MalformedInstruction,
        FaultKind::DivideByZero,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaultKind::CodeAccess => "code-access",
            FaultKind::DataAccess => "data-access",
            FaultKind::MissingReference => "missing-reference",
            FaultKind::MalformedInstruction => "malformed-instruction",
            FaultKind::DivideByZero => "divide-by-zero",
        }
    }
}

/// A fault raised by one engine step.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {detail}", .kind.as_str())]
pub struct EngineFault {
    pub kind: FaultKind,
    pub detail: String,
}

impl EngineFault {
    pub fn new(kind: FaultKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Display-ready description of a fault at a given instruction position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub title: String,
    pub message: String,
    pub instruction_pointer: usize,
}

const RUN_TIME_ERROR: &str = "Run time error";
const PROGRAM_ERROR: &str = "Program error";

/// Map a fault to its report. Pure: never touches controller state.
pub fn classify(fault: &EngineFault, instruction_pointer: usize) -> FaultReport {
    let ip = instruction_pointer;
    let (title, head) = match fault.kind {
        FaultKind::CodeAccess => (RUN_TIME_ERROR, format!("Illegal access to code from line {ip}")),
        FaultKind::DataAccess => (RUN_TIME_ERROR, format!("Illegal access to data {ip}")),
        FaultKind::MissingReference => (RUN_TIME_ERROR, format!("Missing reference at {ip}")),
        FaultKind::MalformedInstruction => {
            (PROGRAM_ERROR, format!("Illegal instruction argument at {ip}"))
        }
        FaultKind::DivideByZero => (RUN_TIME_ERROR, format!("Illegal divide by zero at {ip}")),
    };
    FaultReport {
        kind: fault.kind,
        title: title.to_string(),
        message: format!("{head}\nException message: {}", fault.detail),
        instruction_pointer: ip,
    }
}
