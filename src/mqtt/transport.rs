//! Broker transport seam
//!
//! [`MqttTransport`] is the only place that touches the network. The
//! connection manager drives it; tests swap in a scripted mock.

use super::config::{BrokerAddress, MqttConfig};
use crate::error::BridgeError;
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Opens a new session to `address`, replacing any stale link
    async fn connect(&mut self, address: &BrokerAddress) -> Result<(), BridgeError>;

    /// Publishes one message on the open session
    ///
    /// Resolves once the message has been written to the link, not merely
    /// queued.
    async fn send(&mut self, topic: &str, payload: &str) -> Result<(), BridgeError>;

    /// Gracefully closes the open session
    async fn disconnect(&mut self) -> Result<(), BridgeError>;

    fn is_connected(&self) -> bool;

    /// Resolves once no live link is open
    async fn closed(&self);

    /// Drops the link without a graceful close
    fn dispose(&mut self);
}

struct Link {
    client: AsyncClient,
    driver: JoinHandle<()>,
    /// Cancelled by the driver when the event loop stops
    closed: CancellationToken,
    /// PUBLISH packets written by the event loop so far
    written: watch::Receiver<u64>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    fn release(self) {
        self.closed.cancel();
        self.driver.abort();
    }
}

/// rumqttc-backed transport over plain TCP
pub struct RumqttcTransport {
    config: MqttConfig,
    link: Option<Link>,
}

impl RumqttcTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self { config, link: None }
    }

    fn options(&self, address: &BrokerAddress) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            address.socket_host(),
            address.port(),
        );
        options.set_keep_alive(self.config.keep_alive);
        options
    }

    fn release_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.release();
        }
    }
}

/// Polls until the broker acknowledges the CONNECT packet
async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BridgeError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(connack))) => {
                return if connack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BridgeError::Connection(format!(
                        "broker rejected connection: {:?}",
                        connack.code
                    )))
                };
            }
            Ok(event) => trace!("Event before CONNACK: {:?}", event),
            Err(e) => return Err(BridgeError::Connection(e.to_string())),
        }
    }
}

/// Keeps the rumqttc event loop turning until the link breaks
///
/// rumqttc would reconnect on the next poll after an error; the loop stops
/// instead so reconnects stay under the connection manager's control.
async fn drive_event_loop(
    mut eventloop: EventLoop,
    closed: CancellationToken,
    written: watch::Sender<u64>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(_))) => {
                written.send_modify(|count| *count += 1);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("MQTT disconnect sent, stopping event loop");
                break;
            }
            Ok(event) => trace!("MQTT event: {:?}", event),
            Err(e) => {
                warn!("MQTT event loop stopped: {}", e);
                break;
            }
        }
    }
    closed.cancel();
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    async fn connect(&mut self, address: &BrokerAddress) -> Result<(), BridgeError> {
        self.release_link();

        info!("Connecting to MQTT broker at {}", address);
        let (client, mut eventloop) =
            AsyncClient::new(self.options(address), self.config.request_capacity.max(1));
        tokio::time::timeout(self.config.keep_alive, await_connack(&mut eventloop))
            .await
            .map_err(|_| {
                BridgeError::Connection(format!("no CONNACK from {address} within keep-alive"))
            })??;

        let closed = CancellationToken::new();
        let (written_tx, written) = watch::channel(0);
        let driver = tokio::spawn(drive_event_loop(eventloop, closed.clone(), written_tx));
        self.link = Some(Link {
            client,
            driver,
            closed,
            written,
        });
        Ok(())
    }

    async fn send(&mut self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        let link = match &self.link {
            Some(link) if link.is_alive() => link,
            _ => return Err(BridgeError::Send("no open MQTT session".to_string())),
        };

        let mut written = link.written.clone();
        let before = *written.borrow_and_update();
        link.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))?;

        // requests are written in order and sends never overlap
        let outcome = written.wait_for(|count| *count > before).await.map(|_| ());
        outcome.map_err(|_| {
            BridgeError::Send(format!("link closed before {topic} was written"))
        })
    }

    async fn disconnect(&mut self) -> Result<(), BridgeError> {
        let Some(link) = self.link.take() else {
            return Ok(());
        };
        let result = link
            .client
            .disconnect()
            .await
            .map_err(|e| BridgeError::Connection(e.to_string()));
        link.release();
        result
    }

    fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(Link::is_alive)
    }

    async fn closed(&self) {
        if let Some(link) = &self.link {
            link.closed.cancelled().await;
        }
    }

    fn dispose(&mut self) {
        self.release_link();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const CONNACK_NOT_AUTHORIZED: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    fn transport() -> RumqttcTransport {
        RumqttcTransport::new(MqttConfig {
            client_id: "bridge-test".to_string(),
            keep_alive: Duration::from_secs(60),
            request_capacity: 10,
        })
    }

    async fn listener() -> (TcpListener, BrokerAddress) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, BrokerAddress::new("127.0.0.1", port))
    }

    /// Accepts one client, swallows its CONNECT and answers with `connack`
    async fn accept_with(listener: &TcpListener, connack: &[u8]) -> TcpStream {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 256];
        let read = socket.read(&mut buf).await.unwrap();
        assert!(read > 0);
        assert_eq!(buf[0], 0x10, "expected a CONNECT packet");
        socket.write_all(connack).await.unwrap();
        socket
    }

    #[tokio::test]
    async fn refused_tcp_connect_is_a_connection_error() {
        let (listener, address) = listener().await;
        drop(listener);

        let mut transport = transport();
        let err = transport.connect(&address).await.unwrap_err();

        assert!(matches!(err, BridgeError::Connection(_)), "{err:?}");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn rejected_connack_is_a_connection_error() {
        let (listener, address) = listener().await;
        let broker = tokio::spawn(async move {
            let _socket = accept_with(&listener, &CONNACK_NOT_AUTHORIZED).await;
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut transport = transport();
        let err = transport.connect(&address).await.unwrap_err();

        assert!(matches!(err, BridgeError::Connection(_)), "{err:?}");
        assert!(!transport.is_connected());
        broker.await.unwrap();
    }

    #[tokio::test]
    async fn silent_broker_times_out_within_keep_alive() {
        let (listener, address) = listener().await;
        let broker = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(socket);
        });

        let mut transport = RumqttcTransport::new(MqttConfig {
            client_id: "bridge-test".to_string(),
            keep_alive: Duration::from_secs(1),
            request_capacity: 10,
        });
        let err = tokio::time::timeout(Duration::from_secs(5), transport.connect(&address))
            .await
            .expect("connect hung on a silent broker")
            .unwrap_err();

        assert!(matches!(err, BridgeError::Connection(_)), "{err:?}");
        broker.abort();
    }

    #[tokio::test]
    async fn send_resolves_after_the_publish_is_written() {
        let (listener, address) = listener().await;
        let broker = tokio::spawn(async move {
            let mut socket = accept_with(&listener, &CONNACK_ACCEPTED).await;
            let mut buf = [0u8; 256];
            let read = socket.read(&mut buf).await.unwrap();
            buf[..read].to_vec()
        });

        let mut transport = transport();
        transport.connect(&address).await.unwrap();
        assert!(transport.is_connected());
        transport.send("rpm/data", "3500").await.unwrap();

        let packet = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet[0] & 0xF0, 0x30, "expected a PUBLISH packet");
        let needle = b"rpm/data";
        assert!(packet.windows(needle.len()).any(|w| w == needle));
        assert!(packet.ends_with(b"3500"));
    }

    #[tokio::test]
    async fn broker_hangup_clears_the_link() {
        let (listener, address) = listener().await;
        let broker = tokio::spawn(async move {
            let socket = accept_with(&listener, &CONNACK_ACCEPTED).await;
            drop(socket);
        });

        let mut transport = transport();
        transport.connect(&address).await.unwrap();
        broker.await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), transport.closed())
            .await
            .expect("link loss not noticed");
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send("rpm/data", "1").await,
            Err(BridgeError::Send(_))
        ));
    }

    #[tokio::test]
    async fn closed_is_ready_without_a_link() {
        let transport = transport();
        tokio::time::timeout(Duration::from_millis(100), transport.closed())
            .await
            .expect("no link means already closed");
    }
}
