//! Execution control core for an educational machine simulator.
//!
//! Drives a loaded program through an [`engine::Engine`] one step at a time,
//! to completion, or on a periodic auto-step timer, and turns engine faults
//! into user-facing reports.

pub mod config;
pub mod engine;
pub mod error;
pub mod fault;
pub mod loader;
pub mod model;
pub mod notify;
pub mod orchestrator;
pub mod scheduler;
pub mod state;

pub use config::ControlConfig;
pub use error::ControlError;
pub use fault::{classify, EngineFault, FaultKind, FaultReport};
pub use model::{ChangeCause, ChangeEvent, ControlEvent, RunState, Snapshot};
pub use orchestrator::{CancelToken, Controller, SessionHandle};
