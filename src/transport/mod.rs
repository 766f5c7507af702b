//! Broker link abstraction
//!
//! The wire-level broker protocol (framing, QoS acknowledgment handshakes, TLS)
//! lives behind the [`BrokerLink`] trait. The session layer only ever talks to a
//! link through this trait, which keeps the connectivity state machine testable
//! against an in-process broker (see [`crate::testing::mocks`]) and lets the
//! production build plug in [`mqtt::RumqttLink`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod mqtt;

/// MQTT delivery guarantee supported by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget
    #[default]
    AtMostOnce,
    /// Acknowledged delivery, possibly duplicated
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unsupported QoS level {other} (expected 0 or 1)")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QoS{}", u8::from(*self))
    }
}

/// A topic filter and the QoS requested for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub topic: String,
    #[serde(default)]
    pub qos: QoS,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// Message registered with the broker at connect time and published by the
/// broker if the client vanishes without a clean disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
    pub qos: QoS,
}

/// Client identity presented to the broker on every connect.
///
/// The client identifier must not change between reconnects: the broker keys
/// the persistent session (queued QoS 1 traffic) on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub keepalive: Duration,
    pub will: Option<LastWill>,
}

/// Outcome of a successful connect handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkHandshake {
    /// Broker resumed a stored session for this client identifier
    pub session_present: bool,
}

/// Application message travelling from this client to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Set when the message is being sent again after a reconnection
    pub dup: bool,
}

impl OutboundMessage {
    /// Size of the encoded PUBLISH packet, fixed header included
    pub fn encoded_size(&self) -> usize {
        publish_packet_size(&self.topic, self.payload.len(), self.qos)
    }
}

/// Size of an MQTT 3.1.1 PUBLISH packet carrying `payload_len` bytes
pub fn publish_packet_size(topic: &str, payload_len: usize, qos: QoS) -> usize {
    let packet_id = match qos {
        QoS::AtMostOnce => 0,
        QoS::AtLeastOnce => 2,
    };
    let remaining = 2 + topic.len() + packet_id + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// Application message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
}

/// Errors reported by a broker link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),
    #[error("Connection refused by broker: {0}")]
    Refused(String),
    #[error("Link dropped: {0}")]
    Dropped(String),
    #[error("Subscription to {topic} rejected by broker")]
    SubscriptionRejected { topic: String },
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Link is not open")]
    NotOpen,
}

impl LinkError {
    /// Errors that a reconnect cannot fix
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LinkError::Malformed(_)
                | LinkError::SubscriptionRejected { .. }
                | LinkError::InvalidBrokerUrl(_)
        )
    }
}

/// Wire-level connection to a broker.
///
/// A link is owned by exactly one session driver. `open` may be called again
/// after any error to start a fresh connection; implementations discard
/// whatever state the previous connection left behind.
///
/// `next_inbound` is raced against other work by the driver and must be cancel
/// safe: dropping the future must not lose a received message.
#[async_trait::async_trait]
pub trait BrokerLink: Send + 'static {
    /// Open the network connection and complete the session handshake
    async fn open(&mut self, options: &SessionOptions) -> Result<LinkHandshake, LinkError>;

    /// Subscribe and wait for the broker's acknowledgment
    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), LinkError>;

    /// Publish and, for QoS 1, wait for the broker's acknowledgment
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), LinkError>;

    /// Wait for the next message on a subscribed topic.
    ///
    /// Returns an error once the connection is lost.
    async fn next_inbound(&mut self) -> Result<InboundMessage, LinkError>;

    /// Disconnect cleanly and release the underlying socket
    async fn close(&mut self);
}

const MAX_TOPIC_LEN: usize = 65535;

/// Validate a topic name used for publishing (no wildcards allowed)
pub fn validate_topic_name(topic: &str) -> Result<(), String> {
    if topic.is_empty() {
        return Err("topic must not be empty".to_string());
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(format!("topic exceeds {MAX_TOPIC_LEN} bytes"));
    }
    if topic.contains('\0') {
        return Err(format!("topic {topic:?} contains a NUL character"));
    }
    if topic.contains(['+', '#']) {
        return Err(format!("topic {topic:?} must not contain wildcards"));
    }
    Ok(())
}

/// Validate a subscription topic filter
pub fn validate_topic_filter(filter: &str) -> Result<(), String> {
    if filter.is_empty() {
        return Err("topic filter must not be empty".to_string());
    }
    if filter.len() > MAX_TOPIC_LEN {
        return Err(format!("topic filter exceeds {MAX_TOPIC_LEN} bytes"));
    }
    if filter.contains('\0') {
        return Err(format!("topic filter {filter:?} contains a NUL character"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != levels.len() - 1) {
            return Err(format!(
                "'#' must be the last level on its own in {filter:?}"
            ));
        }
        if level.contains('+') && *level != "+" {
            return Err(format!("'+' must occupy a whole level in {filter:?}"));
        }
    }
    Ok(())
}

/// Check whether a concrete topic name matches a subscription filter
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    // Wildcards never match topics starting with '$'
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
