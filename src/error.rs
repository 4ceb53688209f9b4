use crate::loader::LoadError;
use crate::model::{JobId, RunState};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("no job slot {index} (engine has {count})")]
    NoSuchJob { index: JobId, count: usize },
    #[error("{operation} is not available while {state}")]
    NotAllowed {
        operation: &'static str,
        state: RunState,
    },
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("controller session has shut down")]
    SessionClosed,
}
