//! Status and error event stream
//!
//! The core reports everything it does as [`BridgeEvent`]s. Events are pushed
//! into a bounded channel without waiting; when the observer falls behind the
//! event is dropped and a warning is logged instead. Every event is mirrored to
//! `tracing` so headless runs keep a record even without an observer.

use crate::error::BridgeError;
use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Number of entries the console keeps by default
pub const DEFAULT_HISTORY: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Status,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub kind: EventKind,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl BridgeEvent {
    pub fn status(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Status,
            message: message.into(),
            timestamp: Local::now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Error,
            message: message.into(),
            timestamp: Local::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == EventKind::Error
    }
}

impl fmt::Display for BridgeEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Cloneable sender side of the event stream
#[derive(Clone, Debug)]
pub struct EventReporter {
    tx: mpsc::Sender<BridgeEvent>,
}

impl EventReporter {
    pub fn new(tx: mpsc::Sender<BridgeEvent>) -> Self {
        Self { tx }
    }

    /// Creates a reporter together with the receiving end of its channel
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<BridgeEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn status(&self, message: impl Into<String>) {
        let event = BridgeEvent::status(message);
        info!("{}", event.message);
        self.emit(event);
    }

    pub fn error(&self, message: impl Into<String>) {
        let event = BridgeEvent::error(message);
        error!("{}", event.message);
        self.emit(event);
    }

    /// Mirrors a [`BridgeError`] into the error stream with a context prefix
    pub fn failure(&self, context: &str, err: &BridgeError) {
        self.error(format!("{context}: {err}"));
    }

    fn emit(&self, event: BridgeEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(dropped) => {
                    warn!("Event channel full, dropping: {}", dropped.message)
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

/// Bounded, timestamped history of events as shown by the console
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<BridgeEvent>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }
}

impl EventLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: BridgeEvent) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent event of the given kind
    pub fn last(&self, kind: EventKind) -> Option<&BridgeEvent> {
        self.entries.iter().rev().find(|event| event.kind == kind)
    }

    /// Rendered lines, oldest first
    pub fn render(&self) -> Vec<String> {
        self.entries.iter().map(ToString::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_renders_with_clock_prefix() {
        let mut event = BridgeEvent::status("sent: rpm=3500");
        event.timestamp = Local.with_ymd_and_hms(2024, 5, 1, 9, 4, 7).unwrap();
        assert_eq!(event.to_string(), "[09:04:07] sent: rpm=3500");
    }

    #[test]
    fn log_keeps_only_newest_entries() {
        let mut log = EventLog::with_capacity(3);
        for i in 0..5 {
            log.push(BridgeEvent::status(format!("line {i}")));
        }
        assert_eq!(log.len(), 3);
        let rendered = log.render();
        assert!(rendered[0].ends_with("line 2"));
        assert!(rendered[2].ends_with("line 4"));
    }

    #[test]
    fn default_log_caps_at_150() {
        let mut log = EventLog::default();
        for i in 0..200 {
            log.push(BridgeEvent::error(format!("e{i}")));
        }
        assert_eq!(log.len(), DEFAULT_HISTORY);
        assert_eq!(log.last(EventKind::Error).unwrap().message, "e199");
        assert!(log.last(EventKind::Status).is_none());
    }

    #[tokio::test]
    async fn reporter_drops_events_when_observer_lags() {
        let (reporter, mut rx) = EventReporter::channel(1);
        reporter.status("first");
        reporter.error("second");

        let first = rx.recv().await.unwrap();
        assert_eq!(first.message, "first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failure_prefixes_context() {
        let (reporter, mut rx) = EventReporter::channel(4);
        reporter.failure("publish rpm", &BridgeError::Cancelled);
        let event = rx.try_recv().unwrap();
        assert!(event.is_error());
        assert_eq!(event.message, "publish rpm: operation cancelled");
    }
}
