//! Auto-step scheduling.
//!
//! [`AutoStepper`] holds the enabled flag and period and publishes them over a
//! `watch` channel. [`spawn_timer`] runs the periodic task that turns those
//! settings into [`Tick`]s on a single-slot channel. Each tick carries the
//! generation it was issued under; stopping bumps the generation, so a tick
//! already sitting in the channel is rejected by [`AutoStepper::accepts`].

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

/// Settings observed by the timer task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSettings {
    pub enabled: bool,
    pub period: Duration,
    pub generation: u64,
}

/// One step request from the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    pub generation: u64,
}

pub const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug)]
pub struct AutoStepper {
    settings: watch::Sender<TimerSettings>,
}

impl AutoStepper {
    pub fn new(period: Duration) -> Self {
        let (settings, _) = watch::channel(TimerSettings {
            enabled: false,
            period: period.max(MIN_PERIOD),
            generation: 0,
        });
        Self { settings }
    }

    pub fn settings(&self) -> TimerSettings {
        *self.settings.borrow()
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.borrow().enabled
    }

    pub fn period(&self) -> Duration {
        self.settings.borrow().period
    }

    /// Receiver for a timer task.
    pub fn subscribe(&self) -> watch::Receiver<TimerSettings> {
        self.settings.subscribe()
    }

    pub fn start(&self) {
        self.set_enabled(true);
    }

    /// Disable ticking. Ticks issued before this call are rejected afterwards.
    pub fn stop(&self) {
        self.set_enabled(false);
    }

    /// Flip the enabled flag and return the new value.
    pub fn toggle(&self) -> bool {
        let enabled = !self.is_enabled();
        self.set_enabled(enabled);
        enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.settings.send_if_modified(|s| {
            if s.enabled == enabled {
                return false;
            }
            s.enabled = enabled;
            s.generation += 1;
            debug!(enabled, generation = s.generation, "auto-step toggled");
            true
        });
    }

    /// Change the interval used by the next tick. The interval already running
    /// keeps its start, so repeated calls never postpone ticks.
    pub fn set_period(&self, period: Duration) {
        let period = period.max(MIN_PERIOD);
        self.settings.send_modify(|s| s.period = period);
    }

    /// Whether a tick should be acted on now.
    pub fn accepts(&self, tick: Tick) -> bool {
        let s = self.settings.borrow();
        s.enabled && s.generation == tick.generation
    }
}

/// Single-slot tick channel: at most one tick waits for the consumer.
pub fn tick_channel() -> (mpsc::Sender<Tick>, mpsc::Receiver<Tick>) {
    mpsc::channel(1)
}

/// Spawn the periodic timer. It exits when the stepper is dropped or the tick
/// receiver closes.
pub fn spawn_timer(
    mut settings: watch::Receiver<TimerSettings>,
    ticks: mpsc::Sender<Tick>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        // Start of the current interval and the generation it belongs to. A
        // period change moves the deadline but keeps the interval's start.
        let mut anchor = Instant::now();
        let mut armed: Option<u64> = None;
        loop {
            let current = *settings.borrow_and_update();
            if !current.enabled {
                armed = None;
                if settings.changed().await.is_err() {
                    break;
                }
                continue;
            }
            if armed != Some(current.generation) {
                armed = Some(current.generation);
                anchor = Instant::now();
            }
            tokio::select! {
                _ = tokio::time::sleep_until(anchor + current.period) => {
                    anchor = Instant::now();
                    match ticks.try_send(Tick { generation: current.generation }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            // Consumer still busy with the previous tick.
                            trace!("auto-step tick skipped");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                changed = settings.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("auto-step timer stopped");
    })
}
