//! Text and JSON formatting for CLI output.

use anyhow::Result;
use serde::Serialize;
use stepctl::model::{ChangeEvent, ControlEvent, ExecuteSummary, Snapshot};

/// Where a formatted line should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Stdout,
    Stderr,
}

pub(crate) fn snapshot_line(s: &Snapshot) -> String {
    let auto = if s.auto_stepping { " auto" } else { "" };
    format!("{} job={} ip={}{auto}", s.state, s.job, s.instruction_pointer)
}

fn change_line(ev: &ChangeEvent) -> String {
    let mut line = format!("[{:?}] {}", ev.cause, snapshot_line(&ev.snapshot));
    if let Some(tag) = ev.tag.as_deref() {
        line.push_str(&format!(" ({tag})"));
    }
    line
}

/// Human-readable lines for one event.
pub(crate) fn event_lines(ev: &ControlEvent) -> Vec<(Stream, String)> {
    match ev {
        ControlEvent::Changed(change) => vec![(Stream::Stdout, change_line(change))],
        ControlEvent::Fault(report) => {
            let mut lines = vec![(Stream::Stderr, format!("{}:", report.title))];
            lines.extend(
                report
                    .message
                    .lines()
                    .map(|l| (Stream::Stderr, format!("  {l}"))),
            );
            lines
        }
        ControlEvent::Info(msg) => vec![(Stream::Stderr, msg.clone())],
    }
}

#[derive(Serialize)]
struct Stamped<'a> {
    timestamp_utc: String,
    #[serde(flatten)]
    event: &'a ControlEvent,
}

fn now_utc() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

/// One JSON line per event, stamped with the current time.
pub(crate) fn event_json(ev: &ControlEvent) -> Result<String> {
    Ok(serde_json::to_string(&Stamped {
        timestamp_utc: now_utc(),
        event: ev,
    })?)
}

pub(crate) fn summary_lines(summary: &ExecuteSummary) -> Vec<String> {
    let outcome = if summary.cancelled {
        "cancelled"
    } else {
        "finished"
    };
    vec![
        format!("Execute {outcome}: {} steps, {} faults", summary.steps, summary.faults),
        format!("Final state: {}", summary.final_state),
    ]
}
