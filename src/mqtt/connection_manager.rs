//! Connection manager with resilient publish
//!
//! Owns exactly one broker session. `publish` never gives up on its own: it
//! walks the state machine below until a send succeeds or the caller's
//! cancellation token fires.
//!
//! ```text
//!                 connect ok                send ok
//! Disconnected ──► Connecting ──► Connected ──────► (return)
//!      ▲               │              │
//!      │               │ fail         │ send fail
//!      │               ▼              ▼
//!      └────────── Retrying ◄─────────┘
//!                  (backoff)
//!
//! cancel: any state ──► (return Cancelled)
//! ```

use super::backoff::Backoff;
use super::config::BrokerAddress;
use super::transport::MqttTransport;
use crate::error::BridgeError;
use crate::events::EventReporter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Retrying,
}

/// Broker address shared by the manager and every session handle
///
/// Updates take effect on the next connect attempt, including one made by a
/// publish that is already retrying.
#[derive(Clone, Debug)]
pub struct BrokerTarget {
    address: Arc<watch::Sender<BrokerAddress>>,
    closed: Arc<AtomicBool>,
    events: EventReporter,
}

impl BrokerTarget {
    pub fn new(address: BrokerAddress, events: EventReporter) -> Self {
        let (address, _) = watch::channel(address);
        Self {
            address: Arc::new(address),
            closed: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn current(&self) -> BrokerAddress {
        self.address.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<BrokerAddress> {
        self.address.subscribe()
    }

    /// Validates `address` and makes it the target of future connects
    pub fn update(&self, address: &str) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(disposed());
        }
        let address = BrokerAddress::parse(address)?;
        self.address.send_if_modified(|current| {
            if *current == address {
                false
            } else {
                info!("Broker address changed {} -> {}", current, address);
                *current = address.clone();
                true
            }
        });
        self.events
            .status(format!("broker address set to {address}"));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn disposed() -> BridgeError {
    BridgeError::NotOpen("MQTT session disposed".to_string())
}

/// Why a retry wait ended
enum Wake {
    Elapsed,
    Retargeted,
    Cancelled,
}

pub struct ConnectionManager {
    transport: Box<dyn MqttTransport>,
    target: BrokerTarget,
    address_rx: watch::Receiver<BrokerAddress>,
    backoff: Backoff,
    events: EventReporter,
    state_tx: watch::Sender<ConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        transport: Box<dyn MqttTransport>,
        address: BrokerAddress,
        backoff: Backoff,
        events: EventReporter,
    ) -> Self {
        let target = BrokerTarget::new(address, events.clone());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            address_rx: target.subscribe(),
            target,
            backoff,
            events,
            state_tx,
        }
    }

    pub fn address(&self) -> BrokerAddress {
        self.target.current()
    }

    /// Handle for retargeting the session without going through its owner
    pub fn target(&self) -> BrokerTarget {
        self.target.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch receiver following every state transition
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.target.is_closed() && self.transport.is_connected()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!("Connection state {:?} -> {:?}", current, state);
                *current = state;
                true
            }
        });
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.target.is_closed() {
            Err(disposed())
        } else {
            Ok(())
        }
    }

    /// Latest target, marked as seen so only later updates cut a retry wait short
    fn next_address(&mut self) -> BrokerAddress {
        self.address_rx.borrow_and_update().clone()
    }

    /// Connects unless a live session already exists
    ///
    /// Failures are returned to the caller and are not retried here.
    pub async fn connect(&mut self) -> Result<(), BridgeError> {
        self.ensure_open()?;
        if self.transport.is_connected() {
            debug!("Already connected to {}", self.address());
            self.set_state(ConnectionState::Connected);
            return Ok(());
        }

        let address = self.next_address();
        self.set_state(ConnectionState::Connecting);
        match self.transport.connect(&address).await {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                self.events.status(format!("connected to broker {address}"));
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Best-effort graceful close; never fails
    pub async fn disconnect(&mut self) {
        if self.target.is_closed() || !self.transport.is_connected() {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        if let Err(e) = self.transport.disconnect().await {
            warn!("Error while closing MQTT session: {}", e);
        }
        self.set_state(ConnectionState::Disconnected);
        self.events
            .status(format!("disconnected from broker {}", self.address()));
    }

    /// Retargets future connects; an open session is left untouched
    pub fn update_address(&self, address: &str) -> Result<(), BridgeError> {
        self.target.update(address)
    }

    /// Resolves once the open link has gone away
    pub async fn link_lost(&self) {
        self.transport.closed().await
    }

    /// Moves a `Connected` session whose link dropped back to `Disconnected`
    pub fn note_link_lost(&self) {
        if self.state() == ConnectionState::Connected && !self.transport.is_connected() {
            self.set_state(ConnectionState::Disconnected);
            self.events
                .error(format!("connection to broker {} lost", self.address()));
        }
    }

    /// Publishes `payload` on `topic`, reconnecting and retrying until one send
    /// succeeds or `cancel` fires
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &str,
        cancel: &CancellationToken,
    ) -> Result<(), BridgeError> {
        loop {
            self.ensure_open()?;
            if cancel.is_cancelled() {
                return Err(self.cancelled(topic));
            }

            if !self.transport.is_connected() {
                let address = self.next_address();
                self.set_state(ConnectionState::Connecting);
                let attempt = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.transport.connect(&address) => Some(result),
                };
                match attempt {
                    None => return Err(self.cancelled(topic)),
                    Some(Ok(())) => {
                        self.events.status(format!("connected to broker {address}"));
                    }
                    Some(Err(e)) => {
                        if !self.retry_after(&e, cancel).await {
                            return Err(self.cancelled(topic));
                        }
                        continue;
                    }
                }
            }

            self.set_state(ConnectionState::Connected);
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.transport.send(topic, payload) => Some(result),
            };
            match attempt {
                None => return Err(self.cancelled(topic)),
                Some(Ok(())) => {
                    self.backoff.reset();
                    debug!("Published {} -> {}", topic, payload);
                    return Ok(());
                }
                Some(Err(e)) => {
                    // stale link, force a fresh connect on the next pass
                    self.transport.dispose();
                    if !self.retry_after(&e, cancel).await {
                        return Err(self.cancelled(topic));
                    }
                }
            }
        }
    }

    /// Reports `err` and sleeps for the next backoff delay; false when cancelled
    ///
    /// A new broker address ends the wait early and restarts the backoff.
    async fn retry_after(&mut self, err: &BridgeError, cancel: &CancellationToken) -> bool {
        self.set_state(ConnectionState::Retrying);
        let delay = self.backoff.next_sleep();
        self.events.error(format!(
            "{} (attempt {}, retrying in {} ms)",
            err,
            self.backoff.attempt(),
            delay.as_millis()
        ));

        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Wake::Cancelled,
            Ok(()) = self.address_rx.changed() => Wake::Retargeted,
            _ = tokio::time::sleep(delay) => Wake::Elapsed,
        };
        match wake {
            Wake::Cancelled => false,
            Wake::Retargeted => {
                info!("Broker address changed, retrying now");
                self.backoff.reset();
                true
            }
            Wake::Elapsed => true,
        }
    }

    fn cancelled(&self, topic: &str) -> BridgeError {
        debug!("Publish to {} cancelled", topic);
        let state = if self.transport.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.set_state(state);
        BridgeError::Cancelled
    }

    /// Releases the connection handle; later calls are no-ops
    pub fn dispose(&mut self) {
        if self.target.is_closed() {
            return;
        }
        self.transport.dispose();
        self.target.close();
        self.set_state(ConnectionState::Disconnected);
        info!("MQTT session disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BridgeEvent;
    use crate::mqtt::transport::mock::MockTransport;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_millis(250);

    fn manager(mock: &MockTransport) -> (ConnectionManager, mpsc::Receiver<BridgeEvent>) {
        let (events, rx) = EventReporter::channel(64);
        let manager = ConnectionManager::new(
            Box::new(mock.clone()),
            BrokerAddress::new("old.example", 1883),
            Backoff::new(DELAY, Duration::from_secs(2), 2.0),
            events,
        );
        (manager, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn connect_twice_opens_one_session() {
        let mock = MockTransport::new();
        let (mut manager, _rx) = manager(&mock);

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(mock.connect_attempts().len(), 1);
        assert!(manager.is_connected());
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn disconnect_twice_closes_once() {
        let mock = MockTransport::new();
        let (mut manager, _rx) = manager(&mock);

        manager.connect().await.unwrap();
        manager.disconnect().await;
        manager.disconnect().await;

        assert_eq!(mock.closes(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn direct_connect_failure_reaches_caller() {
        let mock = MockTransport::new();
        mock.fail_connects(1);
        let (mut manager, _rx) = manager(&mock);

        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert_eq!(mock.connect_attempts().len(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn updated_address_is_used_by_next_connect() {
        let mock = MockTransport::new();
        let (mut manager, _rx) = manager(&mock);

        manager.connect().await.unwrap();
        manager.update_address("new.example:1884").unwrap();
        assert!(manager.is_connected(), "open session must survive the update");

        manager.disconnect().await;
        manager.connect().await.unwrap();

        let attempts = mock.connect_attempts();
        assert_eq!(attempts.last().unwrap(), &BrokerAddress::new("new.example", 1884));
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        let mock = MockTransport::new();
        let (manager, _rx) = manager(&mock);

        let err = manager.update_address("  ").unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
        assert_eq!(manager.address(), BrokerAddress::new("old.example", 1883));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_retries_after_failed_connect() {
        let mock = MockTransport::new();
        mock.fail_connects(1);
        let (mut manager, mut rx) = manager(&mock);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        manager.publish("rpm/data", "3500", &cancel).await.unwrap();

        assert!(started.elapsed() >= DELAY);
        assert_eq!(mock.connect_attempts().len(), 2);
        assert_eq!(mock.sent(), vec![("rpm/data".to_string(), "3500".to_string())]);

        let errors: Vec<_> = drain(&mut rx).into_iter().filter(|e| e.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("connection error"));
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_publish_follows_a_new_address() {
        let mock = MockTransport::new();
        mock.refuse_host("old.example");
        let (mut manager, _rx) = manager(&mock);
        let target = manager.target();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let (result, _) = tokio::join!(manager.publish("rpm/data", "3500", &cancel), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            target.update("new.example:1884").unwrap();
        });

        assert_eq!(result, Ok(()));
        // the pending backoff wait is cut short by the update
        assert!(started.elapsed() < Duration::from_secs(5) + DELAY);
        let attempts = mock.connect_attempts();
        assert!(attempts.len() > 2);
        assert_eq!(attempts.last().unwrap(), &BrokerAddress::new("new.example", 1884));
        assert!(attempts[..attempts.len() - 1]
            .iter()
            .all(|a| a.host() == "old.example"));
        assert_eq!(mock.sent(), vec![("rpm/data".to_string(), "3500".to_string())]);
    }

    #[tokio::test]
    async fn dropped_link_is_noticed() {
        let mock = MockTransport::new();
        let (mut manager, mut rx) = manager(&mock);
        manager.connect().await.unwrap();
        drain(&mut rx);

        mock.drop_link();
        tokio::time::timeout(Duration::from_secs(1), manager.link_lost())
            .await
            .expect("link loss not signalled");
        manager.note_link_lost();

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        let errors: Vec<_> = drain(&mut rx).into_iter().filter(|e| e.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "connection to broker old.example:1883 lost");
    }

    #[tokio::test(start_paused = true)]
    async fn publish_reconnects_after_send_failure() {
        let mock = MockTransport::new();
        mock.fail_sends(1);
        let (mut manager, mut rx) = manager(&mock);
        manager.connect().await.unwrap();
        let cancel = CancellationToken::new();

        manager.publish("tps/data", "45", &cancel).await.unwrap();

        assert_eq!(mock.connect_attempts().len(), 2);
        assert_eq!(mock.sent().len(), 1);
        let errors: Vec<_> = drain(&mut rx).into_iter().filter(|e| e.is_error()).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.starts_with("send error"));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_backs_off_between_attempts() {
        let mock = MockTransport::new();
        mock.fail_connects(3);
        let (mut manager, _rx) = manager(&mock);
        let cancel = CancellationToken::new();

        let started = Instant::now();
        manager.publish("gear/data", "3", &cancel).await.unwrap();

        // 250 + 500 + 1000
        assert!(started.elapsed() >= Duration::from_millis(1750));
        assert_eq!(mock.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_publish_stops_retrying() {
        let mock = MockTransport::new();
        mock.fail_connects(1_000);
        let (mut manager, _rx) = manager(&mock);
        let cancel = CancellationToken::new();

        let (result, _) = tokio::join!(manager.publish("oil/data", "90", &cancel), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            cancel.cancel();
        });

        assert_eq!(result, Err(BridgeError::Cancelled));
        assert!(mock.sent().is_empty());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn already_cancelled_publish_sends_nothing() {
        let mock = MockTransport::new();
        let (mut manager, _rx) = manager(&mock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = manager.publish("oil/data", "90", &cancel).await;
        assert_eq!(result, Err(BridgeError::Cancelled));
        assert!(mock.connect_attempts().is_empty());
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_closes_the_session() {
        let mock = MockTransport::new();
        let (mut manager, _rx) = manager(&mock);
        manager.connect().await.unwrap();

        manager.dispose();
        manager.dispose();

        assert_eq!(mock.disposals(), 1);
        assert!(!manager.is_connected());
        let cancel = CancellationToken::new();
        assert!(matches!(
            manager.publish("rpm/data", "1", &cancel).await,
            Err(BridgeError::NotOpen(_))
        ));
        assert!(matches!(manager.connect().await, Err(BridgeError::NotOpen(_))));
    }

    #[tokio::test]
    async fn state_changes_are_observable() {
        let mock = MockTransport::new();
        let (mut manager, _rx) = manager(&mock);
        let mut state_rx = manager.subscribe();

        manager.connect().await.unwrap();
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), ConnectionState::Connected);
    }
}
