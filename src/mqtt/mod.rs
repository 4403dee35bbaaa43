//! # MQTT Session Module
//!
//! Resilient publish path between the telemetry dispatcher and one MQTT broker.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs              - Broker address parsing and connection settings
//! ├── backoff.rs             - Capped exponential retry delays
//! ├── transport.rs           - Transport trait and the rumqttc implementation
//! ├── connection_manager.rs  - Connect/disconnect/publish state machine
//! └── session_worker.rs      - Single-owner task and the cloneable handle
//! ```
//!
//! ## Failure Handling
//!
//! A publish never drops a message on its own. Connection and send failures are
//! reported on the error event stream and retried after a backoff delay. The
//! only way out of the retry loop without a successful send is the caller's
//! cancellation token, which yields [`BridgeError::Cancelled`].
//!
//! [`BridgeError::Cancelled`]: crate::error::BridgeError::Cancelled

pub mod backoff;
pub mod config;
pub mod connection_manager;
pub mod session_worker;
pub mod transport;

pub use backoff::Backoff;
pub use config::{BrokerAddress, MqttConfig};
pub use connection_manager::{BrokerTarget, ConnectionManager, ConnectionState};
pub use session_worker::SessionHandle;
pub use transport::{MqttTransport, RumqttcTransport};

/// Topic carrying the `START`/`STOP` control strings
pub const CONTROL_TOPIC: &str = "control/command";
