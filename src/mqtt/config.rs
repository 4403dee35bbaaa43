//! Broker address parsing and per-connection MQTT settings

use crate::error::BridgeError;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 1883;

/// Broker target in `host[:port]` form; IPv6 hosts are written `[addr]:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    host: String,
    port: u16,
}

impl BrokerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`, falling back to
    /// port 1883
    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(BridgeError::Validation(
                "broker address must not be empty".to_string(),
            ));
        }

        let (host, port) = if let Some(bracketed) = raw.strip_prefix('[') {
            let (host, rest) = bracketed.split_once(']').ok_or_else(|| {
                BridgeError::Validation(format!("unclosed bracket in broker address: {raw}"))
            })?;
            let port = match rest {
                "" => DEFAULT_PORT,
                _ => match rest.strip_prefix(':') {
                    Some(port) => parse_port(port, raw)?,
                    None => {
                        return Err(BridgeError::Validation(format!(
                            "unexpected text after host in broker address: {raw}"
                        )))
                    }
                },
            };
            (host.trim(), port)
        } else if raw.matches(':').count() > 1 {
            return Err(BridgeError::Validation(format!(
                "IPv6 broker addresses must be bracketed, e.g. [::1]:1883: {raw}"
            )));
        } else {
            match raw.split_once(':') {
                Some((host, port)) => (host.trim(), parse_port(port, raw)?),
                None => (raw, DEFAULT_PORT),
            }
        };

        if host.is_empty() {
            return Err(BridgeError::Validation(format!(
                "missing host in broker address: {raw}"
            )));
        }

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Host as it has to appear in a `host:port` socket string
    pub fn socket_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

fn parse_port(port: &str, raw: &str) -> Result<u16, BridgeError> {
    match port.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(BridgeError::Validation(format!(
            "invalid port in broker address: {raw}"
        ))),
    }
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.socket_host(), self.port)
    }
}

/// Settings used to build each new MQTT connection
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub client_id: String,
    pub keep_alive: Duration,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
}
