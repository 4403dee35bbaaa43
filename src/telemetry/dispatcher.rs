//! Telemetry dispatcher with a statum sending gate
//!
//! ```text
//! Stopped ──(start: connect, START)──► Sending ──(stop: STOP)──► Stopped
//! ```
//!
//! Only the `Sending` state forwards readings. Lines that reach a stopped
//! dispatcher are ignored, which lets the caller pause streaming without
//! closing the serial port.

use super::reading::readings;
use super::topics::topic_for;
use crate::events::EventReporter;
use crate::mqtt::{SessionHandle, CONTROL_TOPIC};
use crate::serial::CommandSink;
use statum::{machine, state};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const START_COMMAND: &str = "START";
pub const STOP_COMMAND: &str = "STOP";

#[state]
#[derive(Debug, Clone)]
pub enum GateState {
    Stopped,
    Sending,
}

/// Per-line outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub published: usize,
    /// Readings with a tag outside the topic table
    pub ignored: usize,
    pub invalid: usize,
    pub failed: usize,
}

#[machine]
pub struct TelemetryDispatcher<S: GateState> {
    session: SessionHandle,
    commands: Box<dyn CommandSink>,
    events: EventReporter,
}

impl<S: GateState> TelemetryDispatcher<S> {
    /// Writes `command` to the device and publishes it on the control topic
    async fn send_control(&mut self, command: &str, cancel: &CancellationToken) {
        if let Err(e) = self.commands.send_command(command) {
            self.events
                .failure(&format!("failed to write {command} to serial"), &e);
        }

        match self.session.publish(CONTROL_TOPIC, command, cancel).await {
            Ok(()) => self.events.status(format!("command sent: {command}")),
            Err(e) => self
                .events
                .failure(&format!("failed to publish {command}"), &e),
        }
    }

    fn close_commands(&mut self) {
        self.commands.close();
    }
}

impl TelemetryDispatcher<Stopped> {
    pub fn create(
        session: SessionHandle,
        commands: Box<dyn CommandSink>,
        events: EventReporter,
    ) -> Self {
        Self::new(session, commands, events)
    }

    /// Opens the gate
    ///
    /// A failed connect is reported and left to the resilient publish, so
    /// START still goes out once the broker is reachable.
    pub async fn start(mut self, cancel: &CancellationToken) -> TelemetryDispatcher<Sending> {
        info!("Starting telemetry dispatch");
        if !self.session.is_connected() {
            if let Err(e) = self.session.connect().await {
                self.events.failure("connect before START failed", &e);
            }
        }

        self.send_control(START_COMMAND, cancel).await;
        self.events.status("sending started");
        self.transition()
    }
}

impl TelemetryDispatcher<Sending> {
    /// Publishes every recognized reading of `line`, in line order
    pub async fn process_line(&mut self, line: &str, cancel: &CancellationToken) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for reading in readings(line) {
            let Some(topic) = topic_for(&reading.tag) else {
                debug!("Ignoring unknown tag {}", reading.tag);
                summary.ignored += 1;
                continue;
            };

            let payload = match reading.payload() {
                Ok(payload) => payload,
                Err(e) => {
                    self.events.error(e.to_string());
                    summary.invalid += 1;
                    continue;
                }
            };

            match self.session.publish(topic, &payload, cancel).await {
                Ok(()) => {
                    self.events
                        .status(format!("sent: {}={}", reading.tag, payload));
                    summary.published += 1;
                }
                Err(e) => {
                    self.events
                        .failure(&format!("failed to publish {}", reading.tag), &e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    pub async fn stop(mut self, cancel: &CancellationToken) -> TelemetryDispatcher<Stopped> {
        info!("Stopping telemetry dispatch");
        self.send_control(STOP_COMMAND, cancel).await;
        self.events.status("sending stopped");
        self.transition()
    }
}

/// Runtime holder for whichever gate state is current
pub enum DispatcherGate {
    Stopped(TelemetryDispatcher<Stopped>),
    Sending(TelemetryDispatcher<Sending>),
}

impl DispatcherGate {
    pub fn new(
        session: SessionHandle,
        commands: Box<dyn CommandSink>,
        events: EventReporter,
    ) -> Self {
        DispatcherGate::Stopped(TelemetryDispatcher::create(session, commands, events))
    }

    pub fn is_sending(&self) -> bool {
        matches!(self, DispatcherGate::Sending(_))
    }

    /// No-op when already sending
    pub async fn start(self, cancel: &CancellationToken) -> Self {
        match self {
            DispatcherGate::Stopped(dispatcher) => {
                DispatcherGate::Sending(dispatcher.start(cancel).await)
            }
            sending => {
                debug!("Start ignored, already sending");
                sending
            }
        }
    }

    /// No-op when already stopped
    pub async fn stop(self, cancel: &CancellationToken) -> Self {
        match self {
            DispatcherGate::Sending(dispatcher) => {
                DispatcherGate::Stopped(dispatcher.stop(cancel).await)
            }
            stopped => {
                debug!("Stop ignored, already stopped");
                stopped
            }
        }
    }

    /// Releases the serial command sink once the worker is done with the gate
    pub fn close(&mut self) {
        match self {
            DispatcherGate::Stopped(dispatcher) => dispatcher.close_commands(),
            DispatcherGate::Sending(dispatcher) => dispatcher.close_commands(),
        }
    }

    /// `None` while the gate is closed
    pub async fn process_line(
        &mut self,
        line: &str,
        cancel: &CancellationToken,
    ) -> Option<DispatchSummary> {
        match self {
            DispatcherGate::Sending(dispatcher) => Some(dispatcher.process_line(line, cancel).await),
            DispatcherGate::Stopped(_) => {
                debug!("Gate closed, dropping line");
                None
            }
        }
    }
}
