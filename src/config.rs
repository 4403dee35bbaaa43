//! Bridge configuration file
//!
//! Loaded from TOML; every section falls back to its defaults so a partial
//! file is enough. A missing default file is written out on first start.

use crate::mqtt::{Backoff, BrokerAddress, MqttConfig};
use crate::telemetry::OverflowPolicy;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, Level};

const CONFIG_DIR: &str = ".config/telemetry-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BridgeConfig {
    pub log_level: String,
    pub broker: BrokerConfig,
    pub retry: RetryConfig,
    pub serial: SerialConfig,
    pub dispatch: DispatchConfig,
    pub events: EventsConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            broker: BrokerConfig::default(),
            retry: RetryConfig::default(),
            serial: SerialConfig::default(),
            dispatch: DispatchConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// `host` or `host:port`
    pub address: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub request_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "broker.hivemq.com".to_string(),
            client_id: "telemetry-bridge".to_string(),
            keep_alive_secs: 60,
            request_capacity: 100,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 500,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Open the sending gate right after startup
    pub start_sending: bool,
    /// How long STOP may take on shutdown before it is cancelled
    pub shutdown_grace_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            overflow: OverflowPolicy::Block,
            start_sending: false,
            shutdown_grace_ms: 5000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
    pub history: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 512,
            history: crate::events::DEFAULT_HISTORY,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: BridgeConfig =
            toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.log_level()?;
        BrokerAddress::parse(&self.broker.address)?;
        if self.broker.client_id.trim().is_empty() {
            return Err(eyre!("broker.client_id must not be empty"));
        }
        if self.broker.request_capacity == 0 {
            return Err(eyre!("broker.request_capacity must be at least 1"));
        }
        if self.retry.reconnect_delay_ms == 0 {
            return Err(eyre!("retry.reconnect_delay_ms must be at least 1"));
        }
        if self.retry.max_reconnect_delay_ms < self.retry.reconnect_delay_ms {
            return Err(eyre!(
                "retry.max_reconnect_delay_ms must not be below retry.reconnect_delay_ms"
            ));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(eyre!("retry.multiplier must be a number >= 1.0"));
        }
        if self.serial.port.trim().is_empty() {
            return Err(eyre!("serial.port must not be empty"));
        }
        if self.serial.baud_rate == 0 {
            return Err(eyre!("serial.baud_rate must be positive"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(eyre!("dispatch.queue_capacity must be at least 1"));
        }
        if self.events.channel_capacity == 0 || self.events.history == 0 {
            return Err(eyre!("events capacities must be at least 1"));
        }
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        Level::from_str(self.log_level.trim())
            .map_err(|_| eyre!("Unknown log level: {}", self.log_level))
    }

    pub fn broker_address(&self) -> Result<BrokerAddress> {
        Ok(BrokerAddress::parse(&self.broker.address)?)
    }

    pub fn mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            client_id: self.broker.client_id.clone(),
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            request_capacity: self.broker.request_capacity,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.retry.reconnect_delay_ms),
            Duration::from_millis(self.retry.max_reconnect_delay_ms),
            self.retry.multiplier,
        )
    }

    /// `~/.config/telemetry-bridge/config.toml`
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Reads `path`, or the default location (creating it with defaults when
    /// missing) if no path is given
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let path = Self::default_path();
                Self::ensure_default_config(&path).await?;
                path
            }
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub async fn ensure_default_config(path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file: {}", e))?
        {
            return Ok(());
        }

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(&BridgeConfig::default())
            .map_err(|e| eyre!("Failed to serialize default config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write default config: {}", e))?;
        info!("Wrote default configuration to {}", path.display());
        Ok(())
    }
}
