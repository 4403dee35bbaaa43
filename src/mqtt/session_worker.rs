//! Single-owner task for the MQTT session
//!
//! The [`ConnectionManager`] lives inside one tokio task. Every caller goes
//! through a cloneable [`SessionHandle`] that queues a [`SessionAction`] and
//! waits on a oneshot reply, so connects, publishes and disconnects can never
//! interleave. Address updates skip the queue and go straight to the shared
//! [`BrokerTarget`], so they reach a publish that is stuck retrying.
//!
//! While idle the worker also watches the transport and reports a dropped
//! link as `Disconnected`.

use super::connection_manager::{BrokerTarget, ConnectionManager, ConnectionState};
use crate::error::BridgeError;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

macro_rules! handle_action {
    ($action:expr, $response_tx:expr) => {
        if $response_tx.send($action).is_err() {
            error!("Failed to send session response");
        }
    };
}

const ACTION_QUEUE: usize = 32;

#[derive(Debug)]
pub enum SessionAction {
    Connect {
        response_tx: oneshot::Sender<Result<(), BridgeError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        topic: String,
        payload: String,
        cancel: CancellationToken,
        response_tx: oneshot::Sender<Result<(), BridgeError>>,
    },
    Dispose {
        response_tx: oneshot::Sender<()>,
    },
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: Sender<SessionAction>,
    target: BrokerTarget,
    state_rx: watch::Receiver<ConnectionState>,
}

impl SessionHandle {
    /// Moves `manager` into its own task and returns the handle to it
    pub fn spawn(manager: ConnectionManager) -> (Self, JoinHandle<()>) {
        let state_rx = manager.subscribe();
        let target = manager.target();
        let (tx, rx) = channel::<SessionAction>(ACTION_QUEUE);
        let worker = tokio::spawn(run_session(manager, rx));
        (
            Self {
                tx,
                target,
                state_rx,
            },
            worker,
        )
    }

    async fn request<T>(
        &self,
        action: SessionAction,
        response_rx: oneshot::Receiver<T>,
    ) -> Result<T, BridgeError> {
        self.tx.send(action).await.map_err(|_| worker_gone())?;
        response_rx.await.map_err(|_| worker_gone())
    }

    pub async fn connect(&self) -> Result<(), BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(SessionAction::Connect { response_tx }, response_rx)
            .await?
    }

    /// Best-effort; a stopped worker counts as disconnected
    pub async fn disconnect(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if let Err(e) = self
            .request(SessionAction::Disconnect { response_tx }, response_rx)
            .await
        {
            debug!("Disconnect skipped: {}", e);
        }
    }

    /// Retargets future connects without waiting for queued work
    pub fn update_address(&self, address: &str) -> Result<(), BridgeError> {
        self.target.update(address)
    }

    /// Resilient publish; resolves to `Cancelled` as soon as `cancel` fires,
    /// even while the request is still queued behind other work
    pub async fn publish(
        &self,
        topic: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        let (response_tx, response_rx) = oneshot::channel();
        let action = SessionAction::Publish {
            topic: topic.to_string(),
            payload: payload.to_string(),
            cancel: cancel.clone(),
            response_tx,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            result = self.request(action, response_rx) => result?,
        }
    }

    /// Safe to call repeatedly and after the worker has stopped
    pub async fn dispose(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if let Err(e) = self
            .request(SessionAction::Dispose { response_tx }, response_rx)
            .await
        {
            debug!("Dispose skipped: {}", e);
        }
    }

    /// Last state reported by the session, without waiting on the worker
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }
}

fn worker_gone() -> BridgeError {
    BridgeError::NotOpen("MQTT session worker stopped".to_string())
}

async fn run_session(mut manager: ConnectionManager, mut rx: Receiver<SessionAction>) {
    info!("MQTT session worker started for {}", manager.address());
    loop {
        let action = tokio::select! {
            action = rx.recv() => action,
            _ = manager.link_lost(), if manager.state() == ConnectionState::Connected => {
                manager.note_link_lost();
                continue;
            }
        };
        let Some(action) = action else {
            break;
        };

        match action {
            SessionAction::Connect { response_tx } => {
                handle_action!(manager.connect().await, response_tx);
            }
            SessionAction::Disconnect { response_tx } => {
                handle_action!(manager.disconnect().await, response_tx);
            }
            SessionAction::Publish {
                topic,
                payload,
                cancel,
                response_tx,
            } => {
                handle_action!(manager.publish(&topic, &payload, &cancel).await, response_tx);
            }
            SessionAction::Dispose { response_tx } => {
                handle_action!(manager.dispose(), response_tx);
            }
        }
    }
    manager.dispose();
    info!("MQTT session worker stopped");
}
