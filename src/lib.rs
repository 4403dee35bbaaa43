//! Serial telemetry to MQTT bridge
//!
//! Reads `tag:value,tag:value` lines from a serial device and publishes each
//! recognized reading to `<tag>/data` on an MQTT broker, reconnecting and
//! retrying on its own until every message is out.

pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod mqtt;
pub mod serial;
pub mod telemetry;

pub use error::BridgeError;
