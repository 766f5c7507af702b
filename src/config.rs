//! Configuration for the telemetry publisher
//!
//! Loaded from a TOML file. Every section except `[session]` is optional and
//! falls back to the defaults below.
//!
//! ```toml
//! [session]
//! broker_url = "mqtt://192.168.0.10:1883"
//! keepalive_secs = 120
//! clean_session = false
//!
//! [session.will]
//! topic = "result"
//! payload = "Goodbye cruel world!"
//! # enabled = false    # connect without a last will
//!
//! [[subscriptions]]
//! topic = "foo_topic"
//! qos = 1
//!
//! [publisher]
//! topic = "result"
//! period_secs = 5
//! ```

use crate::session::{ReconnectConfig, DEFAULT_HANDLER_DEADLINE};
use crate::tasks::{FatalPublishPolicy, PayloadFormat};
use crate::transport::mqtt::BrokerAddress;
use crate::transport::{
    validate_topic_filter, validate_topic_name, LastWill, QoS, SessionOptions, Subscription,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Longest client identifier we accept
const MAX_CLIENT_ID_LEN: usize = 128;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherConfig {
    pub session: SessionSection,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub connectivity: ConnectivitySection,
}

/// Broker session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Broker URL (`mqtt://host:port` or `mqtts://host:port`)
    pub broker_url: String,
    /// Client identifier; derived from the machine identity when omitted
    pub client_id: Option<String>,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// `false` keeps a persistent session so QoS 1 traffic survives outages
    #[serde(default)]
    pub clean_session: bool,
    #[serde(default)]
    pub will: WillSection,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

/// Last will registered on every connect
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WillSection {
    /// `false` connects without a will
    pub enabled: bool,
    pub topic: String,
    pub payload: String,
    pub retain: bool,
    pub qos: QoS,
}

impl Default for WillSection {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: "result".to_string(),
            payload: "Goodbye cruel world!".to_string(),
            retain: false,
            qos: QoS::AtMostOnce,
        }
    }
}

/// Telemetry publisher settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublisherSection {
    pub topic: String,
    pub qos: QoS,
    pub period_secs: u64,
    /// Unacknowledged messages allowed before a tick waits (1 = every tick waits)
    pub max_in_flight: usize,
    pub format: PayloadFormat,
    pub on_fatal: FatalPublishPolicy,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            topic: "result".to_string(),
            qos: QoS::AtLeastOnce,
            period_secs: 5,
            max_in_flight: 1,
            format: PayloadFormat::Text,
            on_fatal: FatalPublishPolicy::Skip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatSection {
    pub interval_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self { interval_ms: 500 }
    }
}

/// Connectivity handler settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectivitySection {
    /// Pause inside the connectivity handler after each transition
    pub settle_ms: u64,
    /// Bound on any single handler invocation
    pub handler_deadline_ms: u64,
}

impl Default for ConnectivitySection {
    fn default() -> Self {
        Self {
            settle_ms: 1000,
            handler_deadline_ms: DEFAULT_HANDLER_DEADLINE.as_millis() as u64,
        }
    }
}

fn default_keepalive_secs() -> u64 {
    120
}

fn default_max_packet_size() -> usize {
    256 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client ID: {0}")]
    InvalidClientId(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PublisherConfig {
    /// Load, validate and complete a configuration file.
    ///
    /// A missing client identifier is derived here, once, so every reconnect
    /// presents the same one.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: PublisherConfig = toml::from_str(content)?;
        if config.session.client_id.is_none() {
            config.session.client_id = Some(derive_client_id());
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker_address()?;

        if let Some(client_id) = &self.session.client_id {
            validate_client_id(client_id)?;
        }

        if self.session.keepalive_secs > u16::MAX as u64 {
            return Err(ConfigError::InvalidConfig(format!(
                "keepalive_secs must be at most {}",
                u16::MAX
            )));
        }
        if self.session.max_packet_size == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_packet_size must be greater than 0".to_string(),
            ));
        }
        if self.session.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.session.will.enabled {
            validate_topic_name(&self.session.will.topic).map_err(ConfigError::InvalidTopic)?;
        }
        for subscription in &self.subscriptions {
            validate_topic_filter(&subscription.topic).map_err(ConfigError::InvalidTopic)?;
        }
        validate_topic_name(&self.publisher.topic).map_err(ConfigError::InvalidTopic)?;

        if self.publisher.period_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "publisher.period_secs must be greater than 0".to_string(),
            ));
        }
        if self.publisher.max_in_flight == 0 {
            return Err(ConfigError::InvalidConfig(
                "publisher.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat.interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.connectivity.handler_deadline_ms <= self.connectivity.settle_ms {
            return Err(ConfigError::InvalidConfig(
                "connectivity.handler_deadline_ms must exceed settle_ms".to_string(),
            ));
        }

        self.reconnect
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("reconnect: {e}")))
    }

    pub fn broker_address(&self) -> Result<BrokerAddress, ConfigError> {
        BrokerAddress::parse(&self.session.broker_url)
            .map_err(|e| ConfigError::InvalidBrokerUrl(e.to_string()))
    }

    pub fn client_id(&self) -> String {
        self.session
            .client_id
            .clone()
            .unwrap_or_else(derive_client_id)
    }

    /// Options presented to the broker on every connect
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            client_id: self.client_id(),
            clean_session: self.session.clean_session,
            keepalive: Duration::from_secs(self.session.keepalive_secs),
            will: Some(&self.session.will)
                .filter(|will| will.enabled)
                .map(|will| LastWill {
                    topic: will.topic.clone(),
                    payload: Bytes::from(will.payload.clone()),
                    retain: will.retain,
                    qos: will.qos,
                }),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.session.connect_timeout_secs)
    }

    pub fn publish_period(&self) -> Duration {
        Duration::from_secs(self.publisher.period_secs)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.connectivity.settle_ms)
    }

    pub fn handler_deadline(&self) -> Duration {
        Duration::from_millis(self.connectivity.handler_deadline_ms)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self::from_toml(
            r#"
[session]
broker_url = "mqtt://localhost:1883"
client_id = "test-device"

[[subscriptions]]
topic = "foo_topic"
qos = 1
"#,
        )
        .expect("Test config should parse")
    }
}

/// Validate client ID format
pub fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client ID '{client_id}' must match pattern [a-zA-Z0-9._-]{{1,{MAX_CLIENT_ID_LEN}}}"
        )));
    }

    Ok(())
}

/// Stable client identifier for this machine
///
/// Uses the first 12 hex digits of `/etc/machine-id`, then the host name.
pub fn derive_client_id() -> String {
    if let Ok(machine_id) = std::fs::read_to_string("/etc/machine-id") {
        if let Some(client_id) = client_id_from_machine_id(&machine_id) {
            return client_id;
        }
    }

    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .unwrap_or_default();
    client_id_from_hostname(&hostname)
}

fn client_id_from_machine_id(machine_id: &str) -> Option<String> {
    let hex: String = machine_id
        .trim()
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(12)
        .collect::<String>()
        .to_lowercase();
    (hex.len() == 12).then(|| format!("telemetry-{hex}"))
}

fn client_id_from_hostname(hostname: &str) -> String {
    let sanitized: String = hostname
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .take(MAX_CLIENT_ID_LEN - "telemetry-".len())
        .collect();

    if sanitized.is_empty() {
        "telemetry-device".to_string()
    } else {
        format!("telemetry-{sanitized}")
    }
}
