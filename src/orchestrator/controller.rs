//! Execution controller.
//!
//! Owns the engine, the run state and the auto-stepper, and is the only place
//! that mutates them. Every engine step goes through `&mut self`, so two steps
//! can never overlap. Faults are classified and reported here and never leave
//! this module.

use crate::config::ControlConfig;
use crate::engine::{Engine, StepOutcome};
use crate::error::ControlError;
use crate::fault::classify;
use crate::loader::{JobLoader, LoadError};
use crate::model::{
    Affordances, ChangeCause, ChangeEvent, ExecuteSummary, JobId, RunState, Snapshot,
};
use crate::notify::{Notifier, Observer};
use crate::scheduler::{AutoStepper, Tick};
use crate::state::StateMachine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Asks the user whether the application may shut down.
pub trait ConfirmExit: Send {
    fn confirm_exit(&mut self) -> bool;
}

impl<F> ConfirmExit for F
where
    F: FnMut() -> bool + Send,
{
    fn confirm_exit(&mut self) -> bool {
        self()
    }
}

/// Cooperative cancellation flag for an execute run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// An execute run in progress.
#[derive(Debug)]
pub struct ExecuteRun {
    cancel: CancelToken,
    steps: u64,
    faults: u64,
    cancelled: bool,
}

impl ExecuteRun {
    pub fn token(&self) -> &CancelToken {
        &self.cancel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stepped {
    Retired,
    Halted,
    Faulted,
}

pub struct Controller<E, L> {
    engine: E,
    loader: L,
    machine: StateMachine,
    /// Run state of each job slot while it is not selected.
    parked: Vec<RunState>,
    stepper: AutoStepper,
    notifier: Notifier,
    confirm_exit: Box<dyn ConfirmExit>,
    execute_batch: usize,
}

impl<E, L> std::fmt::Debug for Controller<E, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("machine", &self.machine)
            .field("parked", &self.parked)
            .field("stepper", &self.stepper.settings())
            .field("notifier", &self.notifier)
            .finish_non_exhaustive()
    }
}

impl<E: Engine, L: JobLoader<E>> Controller<E, L> {
    pub fn new(engine: E, loader: L, cfg: &ControlConfig) -> Self {
        let parked = vec![RunState::NoProgramLoaded; engine.job_count()];
        Self {
            engine,
            loader,
            machine: StateMachine::default(),
            parked,
            stepper: AutoStepper::new(cfg.auto_step_period),
            notifier: Notifier::new(),
            confirm_exit: Box::new(|| true),
            execute_batch: cfg.execute_batch.max(1),
        }
    }

    pub fn with_exit_prompt(mut self, prompt: impl ConfirmExit + 'static) -> Self {
        self.confirm_exit = Box::new(prompt);
        self
    }

    pub fn subscribe(&mut self, observer: impl Observer + 'static) {
        self.notifier.subscribe(observer);
    }

    /// Register an entry action run on every state entry.
    pub fn on_enter<F>(&mut self, hook: F)
    where
        F: FnMut(RunState, &Affordances) + Send + 'static,
    {
        self.machine.on_enter(hook);
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn auto_stepper(&self) -> &AutoStepper {
        &self.stepper
    }

    pub fn execute_batch(&self) -> usize {
        self.execute_batch
    }

    pub fn current_state(&self) -> RunState {
        self.machine.current()
    }

    pub fn affordances(&self) -> Affordances {
        self.machine.affordances()
    }

    /// Whether any state has been entered yet.
    pub fn has_state(&self) -> bool {
        self.machine.entries() > 0
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.machine.current(),
            job: self.engine.current_job(),
            instruction_pointer: self.engine.instruction_pointer(),
            auto_stepping: self.stepper.is_enabled(),
        }
    }

    /// Enter the initial state and publish the first notification.
    pub fn start(&mut self) {
        self.stepper.stop();
        self.machine.transition_to(RunState::NoProgramLoaded);
        self.publish(ChangeCause::Started, None);
    }

    /// Deliver a free-form message to observers.
    pub fn info(&mut self, message: &str) {
        self.notifier.info(message);
    }

    fn publish(&mut self, cause: ChangeCause, tag: Option<&str>) {
        let event = ChangeEvent {
            cause,
            tag: tag.map(str::to_string),
            snapshot: self.snapshot(),
        };
        debug!(?cause, state = ?event.snapshot.state, tag, "publishing change");
        self.notifier.publish(&event);
    }

    /// One engine invocation with fault routing. Publishes nothing.
    fn step_engine(&mut self) -> Stepped {
        match self.engine.step() {
            Ok(StepOutcome::Continue) => Stepped::Retired,
            Ok(StepOutcome::Halted) => {
                info!(ip = self.engine.instruction_pointer(), "program halted");
                self.stepper.stop();
                self.machine.transition_to(RunState::Halted);
                Stepped::Halted
            }
            Err(fault) => {
                let report = classify(&fault, self.engine.instruction_pointer());
                warn!(kind = ?fault.kind, ip = report.instruction_pointer, detail = %fault.detail, "engine fault");
                self.notifier.report_fault(&report);
                Stepped::Faulted
            }
        }
    }

    /// Single step. Returns false, touching nothing, when no program is
    /// steppable.
    pub fn step(&mut self) -> bool {
        if !self.current_state().can_step() {
            trace!(state = ?self.current_state(), "step ignored");
            return false;
        }
        let _ = self.step_engine();
        self.publish(ChangeCause::Stepped, None);
        true
    }

    /// Apply a timer tick. Stale ticks (issued before the stepper was last
    /// stopped) are rejected.
    pub fn tick(&mut self, tick: Tick) -> bool {
        if !self.stepper.accepts(tick) || self.current_state() != RunState::AutoStepping {
            trace!(generation = tick.generation, "tick rejected");
            return false;
        }
        let _ = self.step_engine();
        self.publish(ChangeCause::AutoStepped, None);
        true
    }

    /// Start an execute run, or `None` when nothing is steppable.
    pub fn begin_execute(&mut self, cancel: CancelToken) -> Option<ExecuteRun> {
        if !self.current_state().can_step() {
            trace!(state = ?self.current_state(), "execute ignored");
            return None;
        }
        debug!("execute started");
        Some(ExecuteRun {
            cancel,
            steps: 0,
            faults: 0,
            cancelled: false,
        })
    }

    /// Perform up to `budget` engine steps of `run`. Returns true once the run
    /// is over: the state left the steppable set or the token was cancelled.
    pub fn advance_execute(&mut self, run: &mut ExecuteRun, budget: usize) -> bool {
        for _ in 0..budget {
            if !self.current_state().can_step() {
                return true;
            }
            if run.cancel.is_cancelled() {
                run.cancelled = true;
                return true;
            }
            if self.step_engine() == Stepped::Faulted {
                run.faults += 1;
            }
            run.steps += 1;
        }
        !self.current_state().can_step()
    }

    /// Close a run with its single notification.
    pub fn finish_execute(&mut self, run: ExecuteRun) -> ExecuteSummary {
        let cause = if run.cancelled {
            ChangeCause::ExecuteCancelled
        } else {
            ChangeCause::ExecuteCompleted
        };
        info!(steps = run.steps, faults = run.faults, cancelled = run.cancelled, "execute finished");
        self.publish(cause, None);
        ExecuteSummary {
            steps: run.steps,
            faults: run.faults,
            cancelled: run.cancelled,
            final_state: self.current_state(),
        }
    }

    /// Run to completion on the calling thread, checking `cancel` before
    /// every step.
    pub fn execute(&mut self, cancel: &CancelToken) -> Option<ExecuteSummary> {
        let mut run = self.begin_execute(cancel.clone())?;
        let batch = self.execute_batch;
        while !self.advance_execute(&mut run, batch) {}
        Some(self.finish_execute(run))
    }

    /// Flip auto-stepping. Only offered while a program is loaded and not
    /// halted.
    pub fn toggle_auto_step(&mut self) -> Result<bool, ControlError> {
        let state = self.current_state();
        if !state.affordances().toggle_auto_step {
            return Err(ControlError::NotAllowed {
                operation: "toggle auto-step",
                state,
            });
        }
        let on = self.stepper.toggle();
        self.machine.transition_to(if on {
            RunState::AutoStepping
        } else {
            RunState::LoadedNotAutoStepping
        });
        self.publish(ChangeCause::AutoStepToggled, None);
        Ok(on)
    }

    pub fn set_period(&mut self, period: Duration) {
        self.stepper.set_period(period);
    }

    /// Force a state. The auto-stepper follows: it runs only in
    /// `AutoStepping`.
    pub fn set_current_state(&mut self, state: RunState) {
        if state == RunState::AutoStepping {
            self.stepper.start();
        } else {
            self.stepper.stop();
        }
        self.machine.transition_to(state);
        self.publish(ChangeCause::StateForced, None);
    }

    /// Put the current job into the step-ready state.
    pub fn make_ready(&mut self, tag: &str) {
        self.stepper.stop();
        self.machine.transition_to(RunState::LoadedNotAutoStepping);
        self.publish(ChangeCause::Loaded, Some(tag));
    }

    pub fn clear_job(&mut self) {
        self.stepper.stop();
        self.engine.clear_job();
        self.machine.transition_to(RunState::NoProgramLoaded);
        self.publish(ChangeCause::Cleared, Some(ChangeEvent::CLEAR_TAG));
    }

    /// Clear the current job and load it again from the start.
    pub fn reload(&mut self) -> Result<(), ControlError> {
        self.stepper.stop();
        self.clear_job();
        let job = self.engine.current_job();
        self.loader.reload(&mut self.engine, job)?;
        self.make_ready(ChangeEvent::RELOAD_TAG);
        Ok(())
    }

    /// Choose the source file used by the next assemble or load.
    pub fn select_source(&mut self, path: PathBuf) {
        self.loader.select(path);
    }

    pub fn assemble_file(&mut self) -> Result<usize, LoadError> {
        self.loader.assemble()
    }

    pub fn load_file(&mut self) -> Result<(), ControlError> {
        let job = self.engine.current_job();
        self.loader.load(&mut self.engine, job)?;
        self.make_ready(ChangeEvent::LOAD_TAG);
        Ok(())
    }

    /// Switch the active job slot, restoring that slot's run state.
    pub fn set_job(&mut self, index: JobId) -> Result<(), ControlError> {
        let count = self.engine.job_count();
        if index >= count {
            return Err(ControlError::NoSuchJob { index, count });
        }
        let leaving = self.engine.current_job();
        if index == leaving {
            // Same slot: nothing to park, the state stays as it is.
            if self.has_state() {
                self.machine.enter();
                self.publish(ChangeCause::JobSelected, None);
            }
            return Ok(());
        }
        let mut state = self.current_state();
        if state == RunState::AutoStepping {
            self.stepper.stop();
            state = RunState::LoadedNotAutoStepping;
        }
        if let Some(slot) = self.parked.get_mut(leaving) {
            *slot = state;
        }
        self.engine.select_job(index);
        if !self.has_state() {
            return Ok(());
        }
        let target = self
            .parked
            .get(index)
            .copied()
            .unwrap_or(RunState::NoProgramLoaded);
        self.machine.transition_to(target);
        self.publish(ChangeCause::JobSelected, None);
        Ok(())
    }

    /// Ask for confirmation; true means the caller should shut down.
    pub fn exit(&mut self) -> bool {
        if !self.confirm_exit.confirm_exit() {
            return false;
        }
        info!("shutdown requested");
        self.stepper.stop();
        true
    }
}
