//! Change notification fan-out to registered observers.

use crate::fault::FaultReport;
use crate::model::{ChangeEvent, ControlEvent};
use tokio::sync::mpsc::UnboundedSender;

/// Receives controller output. Called synchronously on the controller's
/// context, so implementations must not block on I/O.
pub trait Observer: Send {
    fn on_change(&mut self, event: &ChangeEvent);

    fn on_fault(&mut self, _report: &FaultReport) {}

    fn on_info(&mut self, _message: &str) {}
}

/// Ordered set of observers.
#[derive(Default)]
pub struct Notifier {
    observers: Vec<Box<dyn Observer>>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: impl Observer + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    /// Deliver a change event to every observer in registration order.
    pub fn publish(&mut self, event: &ChangeEvent) {
        for observer in self.observers.iter_mut() {
            observer.on_change(event);
        }
    }

    pub fn report_fault(&mut self, report: &FaultReport) {
        for observer in self.observers.iter_mut() {
            observer.on_fault(report);
        }
    }

    pub fn info(&mut self, message: &str) {
        for observer in self.observers.iter_mut() {
            observer.on_info(message);
        }
    }
}

/// Forwards everything into an unbounded channel for async consumers.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: UnboundedSender<ControlEvent>,
}

impl ChannelObserver {
    pub fn new(tx: UnboundedSender<ControlEvent>) -> Self {
        Self { tx }
    }
}

impl Observer for ChannelObserver {
    fn on_change(&mut self, event: &ChangeEvent) {
        let _ = self.tx.send(ControlEvent::Changed(event.clone()));
    }

    fn on_fault(&mut self, report: &FaultReport) {
        let _ = self.tx.send(ControlEvent::Fault(report.clone()));
    }

    fn on_info(&mut self, message: &str) {
        let _ = self.tx.send(ControlEvent::Info(message.to_string()));
    }
}
