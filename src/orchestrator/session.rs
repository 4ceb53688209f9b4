//! Controller session.
//!
//! A single task owns the [`Controller`] and consumes two producers: commands
//! from presentation layers and ticks from the auto-step timer. Execute runs
//! are advanced in batches between command polls so they stay cancellable.

use super::controller::{CancelToken, Controller, ExecuteRun};
use crate::engine::Engine;
use crate::error::ControlError;
use crate::loader::JobLoader;
use crate::model::{ExecuteSummary, JobId, RunState, Snapshot};
use crate::scheduler;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Reply<T> = Option<oneshot::Sender<T>>;

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum Command {
    Step,
    Execute {
        cancel: CancelToken,
        done: Reply<Option<ExecuteSummary>>,
    },
    CancelExecute,
    ToggleAutoStep(Reply<Result<bool, ControlError>>),
    SetPeriod(Duration),
    Reload(Reply<Result<(), ControlError>>),
    ClearJob,
    SetJob(JobId, Reply<Result<(), ControlError>>),
    SelectSource(PathBuf),
    AssembleFile(Reply<Result<usize, ControlError>>),
    LoadFile(Reply<Result<(), ControlError>>),
    SetCurrentState(RunState),
    Snapshot(oneshot::Sender<Snapshot>),
    Exit(Reply<bool>),
}

/// Cloneable sender side of a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: UnboundedSender<Command>,
}

/// A running execute request.
#[derive(Debug)]
pub struct ExecuteTicket {
    token: CancelToken,
    done: oneshot::Receiver<Option<ExecuteSummary>>,
}

impl ExecuteTicket {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// Wait for the run to end. `None` means nothing was steppable and no run
    /// started.
    pub async fn finished(self) -> Result<Option<ExecuteSummary>, ControlError> {
        self.done.await.map_err(|_| ControlError::SessionClosed)
    }
}

impl SessionHandle {
    pub fn send(&self, cmd: Command) -> Result<(), ControlError> {
        self.tx.send(cmd).map_err(|_| ControlError::SessionClosed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| ControlError::SessionClosed)
    }

    pub fn step(&self) -> Result<(), ControlError> {
        self.send(Command::Step)
    }

    pub fn execute(&self) -> Result<ExecuteTicket, ControlError> {
        let token = CancelToken::new();
        let (tx, done) = oneshot::channel();
        self.send(Command::Execute {
            cancel: token.clone(),
            done: Some(tx),
        })?;
        Ok(ExecuteTicket { token, done })
    }

    pub fn cancel_execute(&self) -> Result<(), ControlError> {
        self.send(Command::CancelExecute)
    }

    pub async fn toggle_auto_step(&self) -> Result<bool, ControlError> {
        self.request(|tx| Command::ToggleAutoStep(Some(tx))).await?
    }

    pub fn set_period(&self, period: Duration) -> Result<(), ControlError> {
        self.send(Command::SetPeriod(period))
    }

    pub async fn reload(&self) -> Result<(), ControlError> {
        self.request(|tx| Command::Reload(Some(tx))).await?
    }

    pub fn clear_job(&self) -> Result<(), ControlError> {
        self.send(Command::ClearJob)
    }

    pub async fn set_job(&self, index: JobId) -> Result<(), ControlError> {
        self.request(|tx| Command::SetJob(index, Some(tx))).await?
    }

    pub fn select_source(&self, path: impl Into<PathBuf>) -> Result<(), ControlError> {
        self.send(Command::SelectSource(path.into()))
    }

    pub async fn assemble_file(&self) -> Result<usize, ControlError> {
        self.request(|tx| Command::AssembleFile(Some(tx))).await?
    }

    pub async fn load_file(&self) -> Result<(), ControlError> {
        self.request(|tx| Command::LoadFile(Some(tx))).await?
    }

    pub fn set_current_state(&self, state: RunState) -> Result<(), ControlError> {
        self.send(Command::SetCurrentState(state))
    }

    pub async fn snapshot(&self) -> Result<Snapshot, ControlError> {
        self.request(Command::Snapshot).await
    }

    pub async fn current_state(&self) -> Result<RunState, ControlError> {
        Ok(self.snapshot().await?.state)
    }

    /// Ask the session to shut down, subject to the exit prompt.
    pub async fn exit(&self) -> Result<bool, ControlError> {
        self.request(|tx| Command::Exit(Some(tx))).await
    }
}

/// Spawn the timer and the session task. The task ends when every handle is
/// dropped or an exit is confirmed, and yields the controller back.
pub fn spawn<E, L>(
    controller: Controller<E, L>,
) -> (SessionHandle, tokio::task::JoinHandle<Controller<E, L>>)
where
    E: Engine + 'static,
    L: JobLoader<E> + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = tokio::spawn(run_session(controller, rx));
    (SessionHandle { tx }, handle)
}

fn respond<T>(reply: Reply<T>, value: T) {
    if let Some(tx) = reply {
        let _ = tx.send(value);
    }
}

/// Reply to the caller, or surface the error to observers when nobody waits.
fn respond_result<E, L, T>(
    controller: &mut Controller<E, L>,
    reply: Reply<Result<T, ControlError>>,
    value: Result<T, ControlError>,
) where
    E: Engine,
    L: JobLoader<E>,
{
    match reply {
        Some(tx) => {
            let _ = tx.send(value);
        }
        None => {
            if let Err(e) = value {
                controller.info(&format!("{e:#}"));
            }
        }
    }
}

struct ActiveRun {
    run: ExecuteRun,
    done: Reply<Option<ExecuteSummary>>,
}

/// Cancel and close the active run, if any, so a state change never lands
/// under a half-finished execute.
fn interrupt<E, L>(controller: &mut Controller<E, L>, active: &mut Option<ActiveRun>)
where
    E: Engine,
    L: JobLoader<E>,
{
    if let Some(ActiveRun { mut run, done }) = active.take() {
        run.token().cancel();
        let _ = controller.advance_execute(&mut run, 1);
        let summary = controller.finish_execute(run);
        respond(done, Some(summary));
    }
}

/// Consume commands and ticks until shutdown.
pub async fn run_session<E, L>(
    mut controller: Controller<E, L>,
    mut cmd_rx: UnboundedReceiver<Command>,
) -> Controller<E, L>
where
    E: Engine,
    L: JobLoader<E>,
{
    let (tick_tx, mut tick_rx) = scheduler::tick_channel();
    let timer = scheduler::spawn_timer(controller.auto_stepper().subscribe(), tick_tx);
    if !controller.has_state() {
        controller.start();
    }
    let batch = controller.execute_batch();
    let mut active: Option<ActiveRun> = None;

    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    debug!("all session handles dropped");
                    break;
                };
                if handle_command(&mut controller, &mut active, cmd) {
                    break;
                }
            }
            Some(tick) = tick_rx.recv() => {
                if active.is_some() {
                    trace!("tick dropped during execute");
                } else {
                    let _ = controller.tick(tick);
                }
            }
            _ = std::future::ready(()), if active.is_some() => {
                if let Some(current) = active.as_mut() {
                    if controller.advance_execute(&mut current.run, batch) {
                        if let Some(ActiveRun { run, done }) = active.take() {
                            let summary = controller.finish_execute(run);
                            respond(done, Some(summary));
                        }
                    }
                }
                // Let commands and other tasks in between batches.
                tokio::task::yield_now().await;
            }
        }
    }

    interrupt(&mut controller, &mut active);
    controller.auto_stepper().stop();
    // Dropping a JoinHandle does not stop the task.
    timer.abort();
    controller
}

/// Apply one command. Returns true when the session should stop.
fn handle_command<E, L>(
    controller: &mut Controller<E, L>,
    active: &mut Option<ActiveRun>,
    cmd: Command,
) -> bool
where
    E: Engine,
    L: JobLoader<E>,
{
    match cmd {
        Command::Step => {
            if active.is_some() {
                controller.info("execute in progress; step ignored");
            } else {
                let _ = controller.step();
            }
        }
        Command::Execute { cancel, done } => {
            if active.is_some() {
                controller.info("execute already in progress");
                respond(done, None);
            } else {
                match controller.begin_execute(cancel) {
                    Some(run) => *active = Some(ActiveRun { run, done }),
                    None => respond(done, None),
                }
            }
        }
        Command::CancelExecute => {
            if let Some(current) = active.as_ref() {
                current.run.token().cancel();
            }
        }
        Command::ToggleAutoStep(reply) => {
            interrupt(controller, active);
            let res = controller.toggle_auto_step();
            respond_result(controller, reply, res);
        }
        Command::SetPeriod(period) => controller.set_period(period),
        Command::Reload(reply) => {
            interrupt(controller, active);
            let res = controller.reload();
            respond_result(controller, reply, res);
        }
        Command::ClearJob => {
            interrupt(controller, active);
            controller.clear_job();
        }
        Command::SetJob(index, reply) => {
            interrupt(controller, active);
            let res = controller.set_job(index);
            respond_result(controller, reply, res);
        }
        Command::SelectSource(path) => controller.select_source(path),
        Command::AssembleFile(reply) => {
            let res = controller.assemble_file().map_err(ControlError::from);
            respond_result(controller, reply, res);
        }
        Command::LoadFile(reply) => {
            interrupt(controller, active);
            let res = controller.load_file();
            respond_result(controller, reply, res);
        }
        Command::SetCurrentState(state) => {
            interrupt(controller, active);
            controller.set_current_state(state);
        }
        Command::Snapshot(reply) => {
            let _ = reply.send(controller.snapshot());
        }
        Command::Exit(reply) => {
            let confirmed = controller.exit();
            respond(reply, confirmed);
            return confirmed;
        }
    }
    false
}
