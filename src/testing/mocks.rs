//! Mock implementations for testing
//!
//! [`MockBroker`] is an in-process stand-in for an MQTT broker that keeps
//! persistent sessions per client identifier, can be made unreachable at will
//! and journals everything it sees. [`MockLink`] is the [`BrokerLink`] that
//! talks to it.

use crate::indicator::Indicator;
use crate::session::{SessionEvent, SessionHandler};
use crate::transport::{
    topic_matches, BrokerLink, InboundMessage, LinkError, LinkHandshake, OutboundMessage, QoS,
    SessionOptions, Subscription,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

/// Everything the mock broker observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected {
        client_id: String,
        clean_session: bool,
        session_present: bool,
    },
    Subscribed {
        topic: String,
    },
    Published {
        topic: String,
        payload: Bytes,
        dup: bool,
    },
    Closed,
}

#[derive(Debug, Default)]
struct StoredSession {
    clean: bool,
    subscriptions: Vec<Subscription>,
    queued: VecDeque<InboundMessage>,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    /// Current connection: (client id, generation)
    connected: Option<(String, u64)>,
    generation: u64,
    sessions: HashMap<String, StoredSession>,
    journal: Vec<BrokerEvent>,
    delivered: Vec<OutboundMessage>,
    fail_subscriptions: usize,
    rejected_filters: Vec<String>,
    lost_publish_acks: usize,
    opens: usize,
    closes: usize,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connected: None,
            generation: 0,
            sessions: HashMap::new(),
            journal: Vec::new(),
            delivered: Vec::new(),
            fail_subscriptions: 0,
            rejected_filters: Vec::new(),
            lost_publish_acks: 0,
            opens: 0,
            closes: 0,
        }
    }
}

impl BrokerState {
    /// End the current connection, discarding a clean session
    fn disconnect(&mut self) {
        if let Some((client_id, _)) = self.connected.take() {
            if self
                .sessions
                .get(&client_id)
                .is_some_and(|session| session.clean)
            {
                self.sessions.remove(&client_id);
            }
        }
    }

    fn live_session(&mut self, generation: Option<u64>) -> Result<&mut StoredSession, LinkError> {
        let generation = generation.ok_or(LinkError::NotOpen)?;
        match &self.connected {
            Some((client_id, current)) if self.reachable && *current == generation => self
                .sessions
                .get_mut(client_id)
                .ok_or_else(|| LinkError::Dropped("session vanished".to_string())),
            _ => Err(LinkError::Dropped("connection lost".to_string())),
        }
    }
}

/// In-process broker shared by the links it hands out
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
    activity: Arc<Notify>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self) -> MockLink {
        MockLink {
            broker: self.clone(),
            generation: None,
        }
    }

    /// Make the broker (un)reachable; going unreachable drops the connection
    pub async fn set_reachable(&self, reachable: bool) {
        let mut state = self.state.lock().await;
        state.reachable = reachable;
        if !reachable {
            state.disconnect();
        }
        drop(state);
        self.activity.notify_waiters();
    }

    /// Fail the next `count` subscribe requests by dropping the connection
    pub async fn fail_next_subscriptions(&self, count: usize) {
        self.state.lock().await.fail_subscriptions = count;
    }

    /// Refuse every subscription to `filter` with a failure return code
    pub async fn reject_subscriptions_to(&self, filter: &str) {
        self.state.lock().await.rejected_filters.push(filter.to_string());
    }

    /// Accept the next `count` publishes but drop the connection before
    /// acknowledging them, so the client has to send them again
    pub async fn lose_next_publish_acks(&self, count: usize) {
        self.state.lock().await.lost_publish_acks = count;
    }

    /// Route a message to every session subscribed to `topic`.
    ///
    /// Persistent sessions queue it even while their client is away. Returns
    /// the number of sessions that accepted it.
    pub async fn inject(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS) -> usize {
        let payload = payload.into();
        let mut state = self.state.lock().await;
        let mut accepted = 0;
        for session in state.sessions.values_mut() {
            if let Some(subscription) = session
                .subscriptions
                .iter()
                .find(|subscription| topic_matches(&subscription.topic, topic))
            {
                let qos = if u8::from(qos) < u8::from(subscription.qos) {
                    qos
                } else {
                    subscription.qos
                };
                session.queued.push_back(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    qos,
                    retained: false,
                });
                accepted += 1;
            }
        }
        drop(state);
        self.activity.notify_waiters();
        accepted
    }

    pub async fn journal(&self) -> Vec<BrokerEvent> {
        self.state.lock().await.journal.clone()
    }

    pub async fn delivered(&self) -> Vec<OutboundMessage> {
        self.state.lock().await.delivered.clone()
    }

    pub async fn delivered_payloads(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .delivered
            .iter()
            .map(|message| String::from_utf8_lossy(&message.payload).into_owned())
            .collect()
    }

    pub async fn opens(&self) -> usize {
        self.state.lock().await.opens
    }

    pub async fn closes(&self) -> usize {
        self.state.lock().await.closes
    }

    /// Suspend until at least `count` messages have been delivered
    pub async fn wait_for_deliveries(&self, count: usize) {
        loop {
            let notified = self.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().await.delivered.len() >= count {
                return;
            }
            notified.await;
        }
    }
}

/// Link to a [`MockBroker`]
#[derive(Debug)]
pub struct MockLink {
    broker: MockBroker,
    generation: Option<u64>,
}

#[async_trait]
impl BrokerLink for MockLink {
    async fn open(&mut self, options: &SessionOptions) -> Result<LinkHandshake, LinkError> {
        let mut state = self.broker.state.lock().await;
        state.opens += 1;
        self.generation = None;
        if !state.reachable {
            return Err(LinkError::Unreachable("mock broker unreachable".to_string()));
        }

        // A new connection for the same client takes over the old one
        state.disconnect();

        let session_present = if options.clean_session {
            state.sessions.remove(&options.client_id);
            false
        } else {
            state
                .sessions
                .get(&options.client_id)
                .is_some_and(|session| !session.clean)
        };
        let session = state.sessions.entry(options.client_id.clone()).or_default();
        session.clean = options.clean_session;

        state.generation += 1;
        let generation = state.generation;
        state.connected = Some((options.client_id.clone(), generation));
        state.journal.push(BrokerEvent::Connected {
            client_id: options.client_id.clone(),
            clean_session: options.clean_session,
            session_present,
        });
        self.generation = Some(generation);
        Ok(LinkHandshake { session_present })
    }

    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), LinkError> {
        let mut state = self.broker.state.lock().await;
        state.live_session(self.generation)?;

        if state.fail_subscriptions > 0 {
            state.fail_subscriptions -= 1;
            state.disconnect();
            return Err(LinkError::Dropped("subscribe acknowledgment lost".to_string()));
        }
        if state.rejected_filters.contains(&subscription.topic) {
            return Err(LinkError::SubscriptionRejected {
                topic: subscription.topic.clone(),
            });
        }

        let session = state.live_session(self.generation)?;
        match session
            .subscriptions
            .iter_mut()
            .find(|existing| existing.topic == subscription.topic)
        {
            Some(existing) => existing.qos = subscription.qos,
            None => session.subscriptions.push(subscription.clone()),
        }
        state.journal.push(BrokerEvent::Subscribed {
            topic: subscription.topic.clone(),
        });
        Ok(())
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), LinkError> {
        let mut state = self.broker.state.lock().await;
        state.live_session(self.generation)?;
        state.delivered.push(message.clone());
        state.journal.push(BrokerEvent::Published {
            topic: message.topic.clone(),
            payload: message.payload.clone(),
            dup: message.dup,
        });

        let result = if message.qos == QoS::AtLeastOnce && state.lost_publish_acks > 0 {
            state.lost_publish_acks -= 1;
            state.disconnect();
            Err(LinkError::Dropped("publish acknowledgment lost".to_string()))
        } else {
            Ok(())
        };
        drop(state);
        self.broker.activity.notify_waiters();
        result
    }

    async fn next_inbound(&mut self) -> Result<InboundMessage, LinkError> {
        loop {
            // Register interest before looking so no notification is missed
            let notified = self.broker.activity.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.broker.state.lock().await;
                let session = state.live_session(self.generation)?;
                if let Some(message) = session.queued.pop_front() {
                    return Ok(message);
                }
            }

            notified.await;
        }
    }

    async fn close(&mut self) {
        let mut state = self.broker.state.lock().await;
        state.closes += 1;
        let current = state.connected.as_ref().map(|(_, generation)| *generation);
        if self.generation.is_some() && self.generation == current {
            state.disconnect();
        }
        state.journal.push(BrokerEvent::Closed);
        self.generation = None;
    }
}

/// Indicator that remembers its level and counts changes
#[derive(Debug, Clone, Default)]
pub struct RecordingIndicator {
    on: Arc<AtomicBool>,
    changes: Arc<AtomicUsize>,
}

impl RecordingIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> usize {
        self.changes.load(Ordering::SeqCst)
    }
}

impl Indicator for RecordingIndicator {
    fn set(&self, on: bool) {
        if self.on.swap(on, Ordering::SeqCst) != on {
            self.changes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::SeqCst)
    }
}

/// Session handler that records every event it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl SessionHandler for RecordingHandler {
    async fn handle(&self, event: &SessionEvent) {
        self.events.lock().await.push(event.clone());
    }
}
