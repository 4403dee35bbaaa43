//! Dispatcher worker task
//!
//! Owns the [`DispatcherGate`] and serializes everything that touches it:
//! lines from the [`LineReceiver`] and start/stop requests from the handle.
//! Control requests take priority over queued lines.

use super::dispatcher::DispatcherGate;
use super::queue::LineReceiver;
use crate::error::BridgeError;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum DispatcherControl {
    Start { response_tx: oneshot::Sender<()> },
    Stop { response_tx: oneshot::Sender<()> },
}

#[derive(Debug)]
struct Slot {
    current: CancellationToken,
    /// `stop()` calls whose `Stop` the worker has not handled yet
    pending_stops: usize,
}

/// Token for the operation currently running inside the worker
///
/// `stop()` cancels it so a publish stuck in its retry loop gives way. Until
/// the worker has handled that stop, every new line or start gets a token that
/// is already cancelled.
#[derive(Clone, Debug)]
struct InFlight {
    slot: Arc<Mutex<Slot>>,
    root: CancellationToken,
}

impl InFlight {
    fn new(root: CancellationToken) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Slot {
                current: root.child_token(),
                pending_stops: 0,
            })),
            root,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs and returns the token for the next line or start
    fn begin(&self) -> CancellationToken {
        let token = self.root.child_token();
        let mut slot = self.lock();
        if slot.pending_stops > 0 {
            token.cancel();
        }
        slot.current = token.clone();
        token
    }

    /// Cancels the running operation and everything begun before the stop lands
    fn request_stop(&self) {
        let mut slot = self.lock();
        slot.pending_stops += 1;
        slot.current.cancel();
    }

    /// Token for sending STOP; only shutdown cancels it
    fn stop_token(&self) -> CancellationToken {
        self.root.child_token()
    }

    fn stop_handled(&self) {
        let mut slot = self.lock();
        slot.pending_stops = slot.pending_stops.saturating_sub(1);
    }
}

/// Cloneable control surface of the dispatcher worker
#[derive(Clone, Debug)]
pub struct DispatcherHandle {
    control_tx: mpsc::Sender<DispatcherControl>,
    sending_rx: watch::Receiver<bool>,
    in_flight: InFlight,
}

impl DispatcherHandle {
    /// Spawns the worker; `shutdown` cancels every publish it has in flight
    /// and ends the task
    pub fn spawn(
        gate: DispatcherGate,
        lines: LineReceiver,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (sending_tx, sending_rx) = watch::channel(gate.is_sending());
        let in_flight = InFlight::new(shutdown.clone());

        let task = tokio::spawn(run_dispatcher(
            gate,
            lines,
            control_rx,
            sending_tx,
            in_flight.clone(),
            shutdown,
        ));

        (
            Self {
                control_tx,
                sending_rx,
                in_flight,
            },
            task,
        )
    }

    async fn request(
        &self,
        build: impl FnOnce(oneshot::Sender<()>) -> DispatcherControl,
    ) -> Result<(), BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.control_tx
            .send(build(response_tx))
            .await
            .map_err(|_| worker_gone())?;
        response_rx.await.map_err(|_| worker_gone())
    }

    /// Opens the gate; resolves once START went out (or was cancelled)
    pub async fn start(&self) -> Result<(), BridgeError> {
        self.request(|response_tx| DispatcherControl::Start { response_tx })
            .await
    }

    /// Cancels whatever is in flight, then closes the gate and sends STOP
    pub async fn stop(&self) -> Result<(), BridgeError> {
        self.in_flight.request_stop();
        self.request(|response_tx| DispatcherControl::Stop { response_tx })
            .await
    }

    pub fn is_sending(&self) -> bool {
        *self.sending_rx.borrow()
    }
}

fn worker_gone() -> BridgeError {
    BridgeError::NotOpen("dispatcher worker stopped".to_string())
}

async fn run_dispatcher(
    mut gate: DispatcherGate,
    mut lines: LineReceiver,
    mut control_rx: mpsc::Receiver<DispatcherControl>,
    sending_tx: watch::Sender<bool>,
    in_flight: InFlight,
    shutdown: CancellationToken,
) {
    info!("Dispatcher worker started");
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            control = control_rx.recv() => match control {
                Some(DispatcherControl::Start { response_tx }) => {
                    gate = gate.start(&in_flight.begin()).await;
                    sending_tx.send_replace(gate.is_sending());
                    let _ = response_tx.send(());
                }
                Some(DispatcherControl::Stop { response_tx }) => {
                    gate = gate.stop(&in_flight.stop_token()).await;
                    in_flight.stop_handled();
                    sending_tx.send_replace(gate.is_sending());
                    let _ = response_tx.send(());
                }
                None => break,
            },
            line = lines.recv() => match line {
                Some(line) => {
                    if let Some(summary) = gate.process_line(&line, &in_flight.begin()).await {
                        debug!("Line dispatched: {:?}", summary);
                    }
                }
                None => {
                    warn!("Line queue closed");
                    break;
                }
            },
        }
    }
    lines.close();
    gate.close();
    info!("Dispatcher worker stopped");
}
