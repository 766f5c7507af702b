//! Periodic telemetry publisher
//!
//! Every period the publisher composes a payload from a snapshot of the session
//! counters and publishes it. Publishing never fails on connectivity: while the
//! session is down the messages queue up in order, and once `max_in_flight`
//! are unacknowledged the loop itself suspends until the broker catches up.
//! With the default window of one, every tick waits for its own acknowledgment.

use crate::session::{PendingAck, SessionError, SessionHandle, SessionStats};
use crate::task_span;
use crate::transport::QoS;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn, Instrument};

pub const DEFAULT_PUBLISH_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PublisherError {
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Payload composition failed: {0}")]
    Compose(String),
}

/// What to do when a publish is rejected as malformed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FatalPublishPolicy {
    /// Log and carry on with the next tick
    #[default]
    Skip,
    /// Stop the publisher
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// `<n> repubs: <r> outages: <o>`
    #[default]
    Text,
    /// `{"seq":n,"republished":r,"outages":o}`
    Json,
}

/// Builds the payload for one tick
pub trait PayloadComposer: Send {
    fn compose(&mut self, seq: u64, stats: &SessionStats) -> Result<Bytes, PublisherError>;
}

#[derive(Debug, Serialize)]
struct TelemetryReport {
    seq: u64,
    republished: u64,
    outages: u64,
}

/// Reports the sequence number with the republish and outage counters
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsPayload {
    format: PayloadFormat,
}

impl StatsPayload {
    pub fn new(format: PayloadFormat) -> Self {
        Self { format }
    }
}

impl PayloadComposer for StatsPayload {
    fn compose(&mut self, seq: u64, stats: &SessionStats) -> Result<Bytes, PublisherError> {
        match self.format {
            PayloadFormat::Text => Ok(Bytes::from(format!(
                "{} repubs: {} outages: {}",
                seq, stats.republished, stats.outages
            ))),
            PayloadFormat::Json => {
                let report = TelemetryReport {
                    seq,
                    republished: stats.republished,
                    outages: stats.outages,
                };
                Ok(Bytes::from(serde_json::to_vec(&report)?))
            }
        }
    }
}

pub struct TelemetryPublisher {
    handle: SessionHandle,
    topic: String,
    qos: QoS,
    period: Duration,
    max_in_flight: usize,
    on_fatal: FatalPublishPolicy,
    composer: Box<dyn PayloadComposer>,
    sequence: u64,
    in_flight: VecDeque<(u64, PendingAck)>,
}

impl TelemetryPublisher {
    pub fn new(handle: SessionHandle, topic: impl Into<String>, period: Duration) -> Self {
        Self {
            handle,
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
            period: period.max(Duration::from_millis(1)),
            max_in_flight: 1,
            on_fatal: FatalPublishPolicy::default(),
            composer: Box::new(StatsPayload::default()),
            sequence: 0,
            in_flight: VecDeque::new(),
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Unacknowledged messages allowed before a tick suspends (minimum 1)
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_fatal_policy(mut self, policy: FatalPublishPolicy) -> Self {
        self.on_fatal = policy;
        self
    }

    pub fn with_composer(mut self, composer: impl PayloadComposer + 'static) -> Self {
        self.composer = Box::new(composer);
        self
    }

    /// Sequence number the next tick will use
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Publish forever. Returns only on a fatal error or when the session closes.
    pub async fn run(mut self) -> Result<(), PublisherError> {
        let span = task_span!(task = "publisher", topic = %self.topic);
        async move {
            info!(
                period_ms = self.period.as_millis() as u64,
                max_in_flight = self.max_in_flight,
                "Publisher started"
            );
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await; // First tick completes immediately, skip it

            loop {
                interval.tick().await;
                if let Err(e) = self.tick().await {
                    error!("Publisher stopped: {}", e);
                    return Err(e);
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Compose and publish one message, then wait for room in the window.
    pub async fn tick(&mut self) -> Result<(), PublisherError> {
        let seq = self.sequence;
        let stats = self.handle.stats();
        let payload = self.composer.compose(seq, &stats)?;
        self.sequence += 1;

        match self.handle.submit(&self.topic, payload, self.qos) {
            Ok(ack) => self.in_flight.push_back((seq, ack)),
            Err(e) => self.rejected(seq, e)?,
        }

        self.settle().await
    }

    async fn settle(&mut self) -> Result<(), PublisherError> {
        loop {
            let completed = match self.in_flight.front_mut() {
                Some((seq, ack)) => ack.try_complete().map(|result| (*seq, result)),
                None => None,
            };
            let Some((seq, result)) = completed else {
                break;
            };
            self.in_flight.pop_front();
            self.acknowledged(seq, result)?;
        }

        while self.in_flight.len() >= self.max_in_flight {
            let Some((seq, ack)) = self.in_flight.pop_front() else {
                break;
            };
            if !self.handle.is_up() {
                info!(seq, "Waiting for the broker session before continuing");
            }
            let result = ack.wait().await;
            self.acknowledged(seq, result)?;
        }
        Ok(())
    }

    fn acknowledged(&self, seq: u64, result: Result<(), SessionError>) -> Result<(), PublisherError> {
        match result {
            Ok(()) => {
                debug!(seq, "Telemetry published");
                Ok(())
            }
            Err(e) => self.rejected(seq, e),
        }
    }

    fn rejected(&self, seq: u64, error: SessionError) -> Result<(), PublisherError> {
        match (&error, self.on_fatal) {
            (SessionError::FatalProtocol(_), FatalPublishPolicy::Skip) => {
                warn!(seq, "Skipping rejected publish: {}", error);
                Ok(())
            }
            _ => Err(error.into()),
        }
    }
}
