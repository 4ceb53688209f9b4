use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepctl::engine::{Engine, Instruction, Program, ScriptEngine, StepOutcome};
use stepctl::loader::{JobLoader, LoadError, ScriptLoader};
use stepctl::model::{ChangeCause, ChangeEvent, ControlEvent, JobId, RunState};
use stepctl::notify::ChannelObserver;
use stepctl::orchestrator::{self, SessionHandle};
use stepctl::{ControlConfig, ControlError, Controller, EngineFault, FaultKind};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Script engine that counts invocations and tracks overlapping steps.
struct CountingEngine {
    inner: ScriptEngine,
    calls: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Engine for CountingEngine {
    fn step(&mut self) -> Result<StepOutcome, EngineFault> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        let res = self.inner.step();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }

    fn instruction_pointer(&self) -> usize {
        self.inner.instruction_pointer()
    }

    fn job_count(&self) -> usize {
        self.inner.job_count()
    }

    fn current_job(&self) -> JobId {
        self.inner.current_job()
    }

    fn select_job(&mut self, job: JobId) {
        self.inner.select_job(job)
    }

    fn clear_job(&mut self) {
        self.inner.clear_job()
    }
}

struct FixedLoader(Program);

impl JobLoader<CountingEngine> for FixedLoader {
    fn assemble(&mut self) -> Result<usize, LoadError> {
        Ok(self.0.len())
    }

    fn load(&mut self, engine: &mut CountingEngine, job: JobId) -> Result<(), LoadError> {
        engine.inner.install(job, self.0.clone());
        Ok(())
    }

    fn reload(&mut self, engine: &mut CountingEngine, job: JobId) -> Result<(), LoadError> {
        self.load(engine, job)
    }
}

type TestController = Controller<CountingEngine, FixedLoader>;
type Session = JoinHandle<TestController>;

struct Harness {
    handle: SessionHandle,
    session: Session,
    events: UnboundedReceiver<ControlEvent>,
    calls: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Harness {
    fn new(program: Program) -> Self {
        Self::with(program, |c| c)
    }

    fn with(program: Program, configure: impl FnOnce(TestController) -> TestController) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let engine = CountingEngine {
            inner: ScriptEngine::new(2),
            calls: calls.clone(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
        };
        let cfg = ControlConfig {
            execute_batch: 64,
            ..ControlConfig::default()
        };
        let mut controller = configure(Controller::new(engine, FixedLoader(program), &cfg));
        let (tx, events) = tokio::sync::mpsc::unbounded_channel();
        controller.subscribe(ChannelObserver::new(tx));
        let (handle, session) = orchestrator::spawn(controller);
        Self {
            handle,
            session,
            events,
            calls,
            max_in_flight,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Round-trip through the session so every earlier command has been
    /// applied, then collect what was published.
    async fn settle(&mut self) -> Vec<ControlEvent> {
        self.handle.snapshot().await.unwrap();
        let mut out = Vec::new();
        while let Ok(ev) = self.events.try_recv() {
            out.push(ev);
        }
        out
    }
}

fn changes(events: &[ControlEvent]) -> Vec<ChangeEvent> {
    events
        .iter()
        .filter_map(|e| match e {
            ControlEvent::Changed(c) => Some(c.clone()),
            _ => None,
        })
        .collect()
}

fn spin() -> Program {
    Program::new(vec![Instruction::Nop, Instruction::Jump { target: 0 }])
}

fn nops_then_halt(n: usize) -> Program {
    let mut instructions = vec![Instruction::Nop; n];
    instructions.push(Instruction::Halt);
    Program::new(instructions)
}

#[tokio::test(start_paused = true)]
async fn nothing_loaded_ignores_step_and_execute() {
    let mut h = Harness::new(spin());
    let started = h.settle().await;
    assert_eq!(changes(&started)[0].cause, ChangeCause::Started);

    h.handle.step().unwrap();
    let summary = h.handle.execute().unwrap().finished().await.unwrap();
    assert!(summary.is_none());
    assert!(changes(&h.settle().await).is_empty());
    assert_eq!(h.calls(), 0);

    h.handle.set_current_state(RunState::Halted).unwrap();
    let _ = h.settle().await;
    h.handle.step().unwrap();
    assert!(changes(&h.settle().await).is_empty());
    assert_eq!(h.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn halted_job_ignores_execute() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    h.handle.set_current_state(RunState::Halted).unwrap();
    let _ = h.settle().await;

    let summary = h.handle.execute().unwrap().finished().await.unwrap();
    assert!(summary.is_none());
    assert!(changes(&h.settle().await).is_empty());
    assert_eq!(h.calls(), 0);
    assert_eq!(h.handle.current_state().await.unwrap(), RunState::Halted);
}

#[tokio::test(start_paused = true)]
async fn missing_source_fails_assemble_through_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("absent.json");
    let mut controller = Controller::new(
        ScriptEngine::new(1),
        ScriptLoader::new(Some(missing)),
        &ControlConfig::default(),
    );
    let (tx, mut events) = tokio::sync::mpsc::unbounded_channel();
    controller.subscribe(ChannelObserver::new(tx));
    let (handle, _session) = orchestrator::spawn(controller);

    let err = handle.assemble_file().await.unwrap_err();
    assert!(matches!(
        err,
        ControlError::Load(LoadError::SourceNotFound { .. })
    ));
    assert_eq!(
        handle.current_state().await.unwrap(),
        RunState::NoProgramLoaded
    );
    let mut published = Vec::new();
    while let Ok(ev) = events.try_recv() {
        published.push(ev);
    }
    let ev = changes(&published);
    assert_eq!(ev.len(), 1);
    assert_eq!(ev[0].cause, ChangeCause::Started);
}

#[tokio::test(start_paused = true)]
async fn load_makes_the_job_ready() {
    let mut h = Harness::new(spin());
    let _ = h.settle().await;
    h.handle.load_file().await.unwrap();
    let ev = changes(&h.settle().await);
    assert_eq!(ev.len(), 1);
    assert_eq!(ev[0].snapshot.state, RunState::LoadedNotAutoStepping);
    assert_eq!(ev[0].tag.as_deref(), Some("Load"));
}

#[tokio::test(start_paused = true)]
async fn three_steps_three_notifications() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    let _ = h.settle().await;

    for _ in 0..3 {
        h.handle.step().unwrap();
    }
    let ev = changes(&h.settle().await);
    assert_eq!(h.calls(), 3);
    assert_eq!(ev.len(), 3);
    assert!(ev.iter().all(|e| e.cause == ChangeCause::Stepped));
    assert_eq!(
        h.handle.current_state().await.unwrap(),
        RunState::LoadedNotAutoStepping
    );
}

#[tokio::test(start_paused = true)]
async fn auto_step_ticks_at_the_configured_period() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    h.handle.set_period(Duration::from_millis(50)).unwrap();
    assert!(h.handle.toggle_auto_step().await.unwrap());
    assert_eq!(
        h.handle.current_state().await.unwrap(),
        RunState::AutoStepping
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    let _ = h.settle().await;
    let ticks = h.calls();
    assert!((8..=12).contains(&ticks), "{ticks} ticks in 500ms");
}

#[tokio::test(start_paused = true)]
async fn period_change_while_auto_stepping_takes_effect() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    h.handle.set_period(Duration::from_millis(100)).unwrap();
    h.handle.toggle_auto_step().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    let _ = h.settle().await;
    let slow = h.calls();
    assert!((4..=6).contains(&slow), "{slow} ticks at 100ms");

    h.handle.set_period(Duration::from_millis(20)).unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let ev = changes(&h.settle().await);
    let fast = h.calls() - slow;
    assert!((20..=27).contains(&fast), "{fast} ticks at 20ms");
    assert!(ev.iter().all(|e| e.cause == ChangeCause::AutoStepped));

    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, RunState::AutoStepping);
    assert!(snapshot.auto_stepping);
}

#[tokio::test(start_paused = true)]
async fn halting_stops_the_auto_stepper() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    h.handle.set_period(Duration::from_millis(20)).unwrap();
    h.handle.toggle_auto_step().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.handle.set_current_state(RunState::Halted).unwrap();
    let _ = h.settle().await;
    let at_halt = h.calls();
    assert!(at_halt > 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snapshot = h.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.state, RunState::Halted);
    assert!(!snapshot.auto_stepping);
    assert_eq!(h.calls(), at_halt);
}

#[tokio::test(start_paused = true)]
async fn fault_is_reported_once_and_state_is_kept() {
    let program = Program::new(vec![
        Instruction::Nop,
        Instruction::Fault {
            kind: FaultKind::DivideByZero,
            detail: "acc / 0".into(),
        },
    ]);
    let mut h = Harness::new(program);
    h.handle.load_file().await.unwrap();
    h.handle.step().unwrap();
    let _ = h.settle().await;

    h.handle.step().unwrap();
    let events = h.settle().await;
    let faults: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ControlEvent::Fault(r) => Some(r.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].kind, FaultKind::DivideByZero);
    assert_eq!(faults[0].instruction_pointer, 1);
    assert!(faults[0].message.contains("Illegal divide by zero at 1"));
    assert_eq!(changes(&events).len(), 1);
    assert_eq!(
        h.handle.current_state().await.unwrap(),
        RunState::LoadedNotAutoStepping
    );
}

#[tokio::test(start_paused = true)]
async fn execute_runs_to_halt_with_a_single_notification() {
    let mut h = Harness::new(nops_then_halt(5000));
    h.handle.load_file().await.unwrap();
    let _ = h.settle().await;

    let summary = h.handle.execute().unwrap().finished().await.unwrap().unwrap();
    assert_eq!(summary.steps, 5001);
    assert_eq!(summary.final_state, RunState::Halted);
    assert!(!summary.cancelled);

    let ev = changes(&h.settle().await);
    assert_eq!(ev.len(), 1);
    assert_eq!(ev[0].cause, ChangeCause::ExecuteCompleted);
    assert_eq!(ev[0].snapshot.state, RunState::Halted);
}

#[tokio::test(start_paused = true)]
async fn endless_execute_stays_responsive_and_cancels() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    let _ = h.settle().await;

    let ticket = h.handle.execute().unwrap();
    // Commands are still served while the run is going.
    h.handle.step().unwrap();
    let during = h.settle().await;
    assert!(changes(&during).is_empty());
    assert!(during
        .iter()
        .any(|e| matches!(e, ControlEvent::Info(m) if m.contains("execute in progress"))));

    ticket.cancel();
    let summary = ticket.finished().await.unwrap().unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.final_state, RunState::LoadedNotAutoStepping);

    let ev = changes(&h.settle().await);
    assert_eq!(ev.len(), 1);
    assert_eq!(ev[0].cause, ChangeCause::ExecuteCancelled);
}

#[tokio::test(start_paused = true)]
async fn clearing_during_execute_closes_the_run_first() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    let _ = h.settle().await;

    let ticket = h.handle.execute().unwrap();
    h.handle.clear_job().unwrap();
    let summary = ticket.finished().await.unwrap().unwrap();
    assert!(summary.cancelled);

    let ev = changes(&h.settle().await);
    let causes: Vec<_> = ev.iter().map(|e| e.cause).collect();
    assert_eq!(causes, vec![ChangeCause::ExecuteCancelled, ChangeCause::Cleared]);
    assert!(ev[1].is_clear());
}

#[tokio::test(start_paused = true)]
async fn manual_and_timer_steps_never_overlap() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    h.handle.set_period(Duration::from_millis(1)).unwrap();
    h.handle.toggle_auto_step().await.unwrap();

    for _ in 0..50 {
        h.handle.step().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let _ = h.settle().await;
    assert!(h.calls() > 50);
    assert_eq!(h.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn double_toggle_returns_to_start() {
    let mut h = Harness::new(spin());
    h.handle.load_file().await.unwrap();
    let before = h.handle.snapshot().await.unwrap();
    assert!(h.handle.toggle_auto_step().await.unwrap());
    assert!(!h.handle.toggle_auto_step().await.unwrap());
    let after = h.handle.snapshot().await.unwrap();
    assert_eq!(before.state, after.state);
    assert_eq!(before.auto_stepping, after.auto_stepping);
    let _ = h.settle().await;

    h.handle.clear_job().unwrap();
    let err = h.handle.toggle_auto_step().await.unwrap_err();
    assert!(matches!(err, ControlError::NotAllowed { .. }));
}

#[tokio::test(start_paused = true)]
async fn bad_job_index_is_rejected() {
    let mut h = Harness::new(spin());
    let _ = h.settle().await;
    let err = h.handle.set_job(9).await.unwrap_err();
    assert!(matches!(err, ControlError::NoSuchJob { index: 9, count: 2 }));
    assert!(changes(&h.settle().await).is_empty());

    h.handle.set_job(1).await.unwrap();
    let ev = changes(&h.settle().await);
    assert_eq!(ev.len(), 1);
    assert_eq!(ev[0].snapshot.job, 1);
}

#[tokio::test(start_paused = true)]
async fn exit_needs_confirmation() {
    let h = Harness::with(spin(), |c| c.with_exit_prompt(|| false));
    assert!(!h.handle.exit().await.unwrap());
    assert!(h.handle.snapshot().await.is_ok());

    let h = Harness::with(spin(), |c| c.with_exit_prompt(|| true));
    assert!(h.handle.exit().await.unwrap());
    let controller = h.session.await.unwrap();
    assert!(!controller.auto_stepper().is_enabled());
    assert!(matches!(
        h.handle.snapshot().await,
        Err(ControlError::SessionClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_ends_the_session() {
    let h = Harness::new(spin());
    let Harness {
        handle, session, ..
    } = h;
    drop(handle);
    let controller = session.await.unwrap();
    assert_eq!(controller.current_state(), RunState::NoProgramLoaded);
}
