use crate::text_summary::{self, Stream};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use stepctl::engine::ScriptEngine;
use stepctl::loader::ScriptLoader;
use stepctl::model::{ControlEvent, RunState};
use stepctl::notify::ChannelObserver;
use stepctl::orchestrator::{self, Command, SessionHandle};
use stepctl::{ControlConfig, Controller};
use tokio::sync::{mpsc, oneshot};

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    fn routed(stream: Stream, line: String) -> Self {
        match stream {
            Stream::Stdout => OutputLine::Stdout(line),
            Stream::Stderr => OutputLine::Stderr(line),
        }
    }
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "stepctl",
    version,
    about = "Step, run and auto-step simulator programs"
)]
pub struct Cli {
    /// Program script (JSON) to assemble and load
    pub script: Option<PathBuf>,

    /// Config file (default: <config dir>/stepctl/config.json when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Auto-step period
    #[arg(long)]
    pub period: Option<humantime::Duration>,

    /// Number of job slots
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Load the script, run it to completion and exit
    #[arg(long, requires = "script")]
    pub execute: bool,

    /// Load the script, auto-step for this long and exit
    #[arg(long, requires = "script", conflicts_with = "execute")]
    pub auto_step_for: Option<humantime::Duration>,

    /// Print events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// Build a `ControlConfig` from the config file and CLI overrides.
pub fn build_config(args: &Cli) -> Result<ControlConfig> {
    let mut cfg = ControlConfig::resolve(args.config.as_deref())?;
    if let Some(p) = args.period {
        cfg.auto_step_period = Duration::from(p);
    }
    if let Some(j) = args.jobs {
        cfg.job_slots = j;
    }
    Ok(cfg.normalized())
}

pub async fn run(args: Cli) -> Result<()> {
    let cfg = build_config(&args)?;
    tracing::debug!(?cfg, "configuration resolved");

    let (out_tx, out_handle) = spawn_output_writer();
    let (evt_tx, mut evt_rx) = mpsc::unbounded_channel::<ControlEvent>();

    let mut controller = Controller::new(
        ScriptEngine::new(cfg.job_slots),
        ScriptLoader::new(args.script.clone()),
        &cfg,
    );
    controller.subscribe(ChannelObserver::new(evt_tx));

    let json = args.json;
    let printer_tx = out_tx.clone();
    let printer = tokio::spawn(async move {
        while let Some(ev) = evt_rx.recv().await {
            if json {
                match text_summary::event_json(&ev) {
                    Ok(line) => {
                        let _ = printer_tx.send(OutputLine::Stdout(line));
                    }
                    Err(e) => {
                        let _ = printer_tx.send(OutputLine::Stderr(format!("{e:#}")));
                    }
                }
            } else {
                for (stream, line) in text_summary::event_lines(&ev) {
                    let _ = printer_tx.send(OutputLine::routed(stream, line));
                }
            }
        }
    });

    let (handle, session) = orchestrator::spawn(controller);

    let res = if args.execute {
        run_execute(&handle, &out_tx).await
    } else if let Some(d) = args.auto_step_for {
        run_auto_step(&handle, Duration::from(d), &out_tx).await
    } else {
        run_interactive(handle.clone(), out_tx.clone());
        Ok(())
    };

    // The session ends once every handle is gone (interactive: EOF or exit).
    drop(handle);
    let _ = session.await.context("controller session failed")?;
    let _ = printer.await;
    drop(out_tx);
    let _ = out_handle.await;
    res
}

async fn load_script(handle: &SessionHandle) -> Result<()> {
    let n = handle.assemble_file().await.context("assemble failed")?;
    tracing::info!(instructions = n, "script assembled");
    handle.load_file().await.context("load failed")?;
    Ok(())
}

async fn run_execute(
    handle: &SessionHandle,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    load_script(handle).await?;
    let ticket = handle.execute()?;
    let token = ticket.token();
    let finished = ticket.finished();
    tokio::pin!(finished);

    let summary = tokio::select! {
        s = &mut finished => s?,
        _ = tokio::signal::ctrl_c() => {
            token.cancel();
            finished.await?
        }
    };
    match summary {
        Some(s) => {
            for line in text_summary::summary_lines(&s) {
                let _ = out_tx.send(OutputLine::Stderr(line));
            }
        }
        None => {
            let _ = out_tx.send(OutputLine::Stderr("Nothing to execute".into()));
        }
    }
    Ok(())
}

async fn run_auto_step(
    handle: &SessionHandle,
    duration: Duration,
    out_tx: &mpsc::UnboundedSender<OutputLine>,
) -> Result<()> {
    load_script(handle).await?;
    handle.toggle_auto_step().await.context("auto-step failed")?;

    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    if handle.current_state().await? == RunState::AutoStepping {
        handle.toggle_auto_step().await?;
    }
    let snapshot = handle.snapshot().await?;
    let _ = out_tx.send(OutputLine::Stderr(format!(
        "Stopped: {}",
        text_summary::snapshot_line(&snapshot)
    )));
    Ok(())
}

const HELP: &str = "\
commands:
  step | s            execute one instruction
  run | x             execute until halted (cancel with `cancel`)
  cancel              cancel a running execute
  auto | a            toggle auto-stepping
  period <duration>   set auto-step period (e.g. 200ms)
  source <path>       choose the script to assemble/load
  assemble            check the selected script
  load                load the selected script into the current job
  reload              reload the current job from the start
  clear               clear the current job
  job <n>             switch job slot
  state <name>        force a state (loaded, auto, halted, none)
  status              show the current state
  exit | quit         leave";

/// Parse one interactive line into a session command.
fn parse_line(line: &str) -> std::result::Result<Option<Command>, String> {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return Ok(None);
    };
    let arg = parts.next();
    let cmd = match word {
        "step" | "s" => Command::Step,
        "run" | "x" | "execute" => Command::Execute {
            cancel: Default::default(),
            done: None,
        },
        "cancel" => Command::CancelExecute,
        "auto" | "a" => Command::ToggleAutoStep(None),
        "period" => {
            let raw = arg.ok_or("period needs a duration")?;
            let d = raw
                .parse::<humantime::Duration>()
                .map(Duration::from)
                .or_else(|_| raw.parse::<u64>().map(Duration::from_millis))
                .map_err(|_| format!("invalid duration: {raw}"))?;
            Command::SetPeriod(d)
        }
        "source" => Command::SelectSource(PathBuf::from(arg.ok_or("source needs a path")?)),
        "assemble" => Command::AssembleFile(None),
        "load" => Command::LoadFile(None),
        "reload" => Command::Reload(None),
        "clear" => Command::ClearJob,
        "job" => {
            let raw = arg.ok_or("job needs an index")?;
            let index = raw
                .parse::<usize>()
                .map_err(|_| format!("invalid job index: {raw}"))?;
            Command::SetJob(index, None)
        }
        "state" | "halt" => {
            let name = if word == "halt" {
                "halted"
            } else {
                arg.ok_or("state needs a name")?
            };
            let state = RunState::parse(name).ok_or_else(|| format!("unknown state: {name}"))?;
            Command::SetCurrentState(state)
        }
        other => return Err(format!("unknown command: {other} (try `help`)")),
    };
    Ok(Some(cmd))
}

/// Read commands from stdin on a dedicated thread. Dropping the handle at EOF
/// ends the session.
fn run_interactive(handle: SessionHandle, out_tx: mpsc::UnboundedSender<OutputLine>) {
    let _ = out_tx.send(OutputLine::Stderr("Type `help` for commands.".into()));
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut lines = stdin.lock().lines();
        while let Some(Ok(line)) = lines.next() {
            match line.trim() {
                "help" | "?" => {
                    let _ = out_tx.send(OutputLine::Stderr(HELP.into()));
                }
                "status" => {
                    let (tx, rx) = oneshot::channel();
                    if handle.send(Command::Snapshot(tx)).is_err() {
                        break;
                    }
                    if let Ok(s) = rx.blocking_recv() {
                        let _ = out_tx.send(OutputLine::Stdout(text_summary::snapshot_line(&s)));
                    }
                }
                "exit" | "quit" | "q" => {
                    let _ = out_tx.send(OutputLine::Stderr(
                        "Do you really wish to exit? [y/N]".into(),
                    ));
                    let confirmed = matches!(
                        lines.next(),
                        Some(Ok(answer)) if answer.trim().eq_ignore_ascii_case("y")
                            || answer.trim().eq_ignore_ascii_case("yes")
                    );
                    if confirmed {
                        let _ = handle.send(Command::Exit(None));
                        break;
                    }
                }
                other => match parse_line(other) {
                    Ok(Some(cmd)) => {
                        if handle.send(cmd).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(msg) => {
                        let _ = out_tx.send(OutputLine::Stderr(msg));
                    }
                },
            }
        }
    });
}
