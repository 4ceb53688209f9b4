//! Execution orchestration.
//!
//! [`Controller`] owns the engine, run state and auto-stepper and implements
//! every control operation synchronously. The session module wraps it in a
//! task that serializes commands and timer ticks, so UI and CLI layers only
//! ever talk to it through a [`SessionHandle`].

mod controller;
mod session;

pub use controller::{CancelToken, ConfirmExit, Controller, ExecuteRun};
pub use session::{run_session, spawn, Command, ExecuteTicket, SessionHandle};
