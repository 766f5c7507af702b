//! Persistent broker session
//!
//! A [`Session`] owns one [`BrokerLink`] and, once connected, a driver task that
//! is the only code touching it. Publishers and subscribers talk to the driver
//! through cheap [`SessionHandle`] clones: requests go through an intake queue
//! and each one carries a oneshot acknowledgment.
//!
//! The driver serves requests strictly in order and only while the session is
//! Up. When the link fails it reports Down, reconnects with backoff, replays
//! the subscription set and only then resumes the queue, so nothing is
//! published against a half-recovered session. Requests made meanwhile simply
//! wait, which is what makes `publish` block across outages.

use super::connectivity::{ConnectivityMonitor, ConnectivityState, OutageCounter};
use super::error::SessionError;
use super::events::{HandlerRegistry, SessionEvent};
use super::reconnect::{ReconnectConfig, ReconnectionDecision};
use super::recovery::RecoveryCoordinator;
use crate::transport::{
    publish_packet_size, validate_topic_filter, validate_topic_name, BrokerLink, LinkError,
    OutboundMessage, QoS, SessionOptions, Subscription,
};
use bytes::Bytes;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Largest PUBLISH packet accepted by default (rumqttc's default packet limit)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 10 * 1024;

/// How long `close` waits for the driver to release the link
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type AckSender = oneshot::Sender<Result<(), SessionError>>;

/// Number of at-least-once messages that had to be carried across a
/// reconnection before the broker acknowledged them.
#[derive(Debug, Clone, Default)]
pub struct RepublishCounter(Arc<AtomicU64>);

impl RepublishCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of the session counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub state: ConnectivityState,
    pub outages: u64,
    pub reconnects: u64,
    pub republished: u64,
}

enum Command {
    Publish {
        message: OutboundMessage,
        ack: AckSender,
        /// Written to a link that has since failed
        sent: bool,
        /// Still pending when a reconnection completed
        redelivery: bool,
    },
    Subscribe {
        subscription: Subscription,
        ack: AckSender,
    },
}

impl Command {
    fn fail(self, error: impl FnOnce() -> SessionError) {
        let ack = match self {
            Command::Publish { ack, .. } | Command::Subscribe { ack, .. } => ack,
        };
        let _ = ack.send(Err(error()));
    }
}

/// Acknowledgment of a submitted publish
///
/// Resolves once the broker has acknowledged the message (QoS 1) or it has
/// been written to the link (QoS 0).
#[derive(Debug)]
pub struct PendingAck {
    rx: oneshot::Receiver<Result<(), SessionError>>,
}

impl PendingAck {
    /// Suspend until the message is acknowledged
    pub async fn wait(self) -> Result<(), SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::Closed))
    }

    /// Non-blocking check; `None` while the message is still pending
    pub fn try_complete(&mut self) -> Option<Result<(), SessionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SessionError::Closed)),
        }
    }
}

/// Cloneable access to a session from other tasks
#[derive(Clone)]
pub struct SessionHandle {
    intake: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<ConnectivityState>,
    outages: OutageCounter,
    reconnects: Arc<AtomicU64>,
    republished: RepublishCounter,
    max_packet_size: usize,
}

impl SessionHandle {
    /// Queue a message for publishing without waiting for it.
    ///
    /// Malformed requests are rejected here with [`SessionError::FatalProtocol`];
    /// everything else is accepted and delivered in submission order.
    pub fn submit(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<PendingAck, SessionError> {
        validate_topic_name(topic).map_err(SessionError::FatalProtocol)?;
        let payload = payload.into();
        let packet_size = publish_packet_size(topic, payload.len(), qos);
        if packet_size > self.max_packet_size {
            return Err(SessionError::FatalProtocol(format!(
                "PUBLISH packet of {} bytes exceeds the {} byte limit",
                packet_size, self.max_packet_size
            )));
        }

        let (ack, rx) = oneshot::channel();
        let command = Command::Publish {
            message: OutboundMessage {
                topic: topic.to_string(),
                payload,
                qos,
                retain: false,
                dup: false,
            },
            ack,
            sent: false,
            redelivery: false,
        };
        self.intake
            .send(command)
            .map_err(|_| SessionError::Closed)?;
        Ok(PendingAck { rx })
    }

    /// Publish and suspend until the message is acknowledged, across any
    /// number of outages.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
    ) -> Result<(), SessionError> {
        self.submit(topic, payload, qos)?.wait().await
    }

    /// Add a subscription. It is re-established after every reconnect.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        validate_topic_filter(topic).map_err(SessionError::FatalProtocol)?;
        let (ack, rx) = oneshot::channel();
        self.intake
            .send(Command::Subscribe {
                subscription: Subscription::new(topic, qos),
                ack,
            })
            .map_err(|_| SessionError::Closed)?;
        PendingAck { rx }.wait().await
    }

    /// Suspend until the session is Up
    pub async fn wait_until_up(&self) -> Result<(), SessionError> {
        let mut state_rx = self.state_rx.clone();
        state_rx
            .wait_for(|state| *state == ConnectivityState::Up)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::Closed)
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_rx.borrow()
    }

    pub fn is_up(&self) -> bool {
        ConnectivityMonitor::can_publish(self.state())
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state(),
            outages: self.outages.get(),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            republished: self.republished.get(),
        }
    }
}

/// A persistent broker session, created once and closed exactly once.
pub struct Session<L: BrokerLink> {
    /// Held until `connect` succeeds, then moved into the driver task
    driver: Option<SessionDriver<L>>,
    task: Option<JoinHandle<()>>,
    handle: SessionHandle,
    shutdown_tx: watch::Sender<bool>,
    closed: bool,
}

impl<L: BrokerLink> Session<L> {
    pub fn new(options: SessionOptions, link: L) -> Self {
        let (intake_tx, intake_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = ConnectivityMonitor::new();
        let republished = RepublishCounter::default();

        let handle = SessionHandle {
            intake: intake_tx,
            state_rx: monitor.subscribe(),
            outages: monitor.outages(),
            reconnects: monitor.reconnects(),
            republished: republished.clone(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        };

        let driver = SessionDriver {
            link,
            options,
            reconnect: ReconnectConfig::default(),
            recovery: RecoveryCoordinator::default(),
            handlers: HandlerRegistry::default(),
            monitor,
            republished,
            intake: intake_rx,
            shutdown_rx,
            queue: VecDeque::new(),
        };

        Self {
            driver: Some(driver),
            task: None,
            handle,
            shutdown_tx,
            closed: false,
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        if let Some(driver) = self.driver.as_mut() {
            driver.reconnect = reconnect;
        }
        self
    }

    pub fn with_subscriptions(mut self, subscriptions: Vec<Subscription>) -> Self {
        if let Some(driver) = self.driver.as_mut() {
            for subscription in subscriptions {
                driver.recovery.add(subscription);
            }
        }
        self
    }

    pub fn with_handlers(mut self, handlers: HandlerRegistry) -> Self {
        if let Some(driver) = self.driver.as_mut() {
            driver.handlers = handlers;
        }
        self
    }

    /// Limit on the encoded PUBLISH size, checked before a message is queued
    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.handle.max_packet_size = max_packet_size;
        self
    }

    /// Connect and recover the session, then start the driver task.
    ///
    /// Retries according to the reconnect policy and fails with
    /// [`SessionError::Connection`] once the startup attempts are exhausted.
    /// Cancelling the returned future leaves the session unconnected and
    /// still closable.
    pub async fn connect(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        let Some(driver) = self.driver.as_mut() else {
            return Err(SessionError::AlreadyConnected);
        };

        driver.establish(true).await?;

        if let Some(driver) = self.driver.take() {
            let span = tracing::info_span!("session_driver", client_id = %driver.options.client_id);
            self.task = Some(tokio::spawn(driver.run().instrument(span)));
        }
        Ok(())
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Add a subscription; before `connect` it is simply recorded.
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        match self.driver.as_mut() {
            Some(driver) => {
                validate_topic_filter(topic).map_err(SessionError::FatalProtocol)?;
                driver.recovery.add(Subscription::new(topic, qos));
                Ok(())
            }
            None => self.handle.subscribe(topic, qos).await,
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.handle.stats()
    }

    /// Disconnect and release the link. Safe to call more than once; only the
    /// first call does anything.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown_tx.send_replace(true);

        // Never connected (or connect failed): the link is still ours
        if let Some(mut driver) = self.driver.take() {
            driver.finish().await;
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await {
                Ok(Ok(())) => debug!("Session driver stopped"),
                Ok(Err(e)) => warn!("Session driver ended abnormally: {}", e),
                Err(_) => {
                    warn!("Session driver did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        let stats = self.handle.stats();
        info!(
            outages = stats.outages,
            reconnects = stats.reconnects,
            republished = stats.republished,
            "Session closed"
        );
    }
}

impl<L: BrokerLink> Drop for Session<L> {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown_tx.send_replace(true);
            if let Some(task) = self.task.take() {
                warn!("Session dropped without close, aborting driver");
                task.abort();
            }
        }
    }
}

/// Resolves once shutdown has been requested or the session is gone
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

/// Link error behind a failed connect that a retry cannot clear
fn permanent_cause(error: &SessionError) -> Option<&LinkError> {
    match error {
        SessionError::Transient(source) | SessionError::Handshake { source, .. }
            if source.is_fatal() =>
        {
            Some(source)
        }
        _ => None,
    }
}

/// Perform interruptible sleep with shutdown monitoring
/// Returns true if sleep completed, false if shutdown requested
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown_requested(shutdown_rx) => {
            info!("Shutdown signal received during reconnection delay, stopping");
            false
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

struct SessionDriver<L: BrokerLink> {
    link: L,
    options: SessionOptions,
    reconnect: ReconnectConfig,
    recovery: RecoveryCoordinator,
    handlers: HandlerRegistry,
    monitor: ConnectivityMonitor,
    republished: RepublishCounter,
    intake: mpsc::UnboundedReceiver<Command>,
    shutdown_rx: watch::Receiver<bool>,
    /// Accepted requests; the front one is the one in progress
    queue: VecDeque<Command>,
}

impl<L: BrokerLink> SessionDriver<L> {
    async fn run(mut self) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            self.drain_intake();

            if self.queue.is_empty() {
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                    command = self.intake.recv() => match command {
                        Some(command) => self.queue.push_back(command),
                        None => break,
                    },
                    inbound = self.link.next_inbound() => match inbound {
                        Ok(message) => {
                            debug!(topic = %message.topic, bytes = message.payload.len(), "Message received");
                            self.dispatch(&SessionEvent::Message(message)).await;
                        }
                        Err(e) => {
                            if !self.recover_link(&mut shutdown_rx, e).await {
                                break;
                            }
                        }
                    },
                }
            } else {
                let outcome = tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown_rx) => break,
                    outcome = self.execute_front() => outcome,
                };
                if let Err(e) = outcome {
                    if !self.recover_link(&mut shutdown_rx, e).await {
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Connect, recover subscriptions and report Up.
    ///
    /// With `startup` set, the reconnect policy's attempt cap applies and
    /// fatal link errors end the attempt immediately.
    async fn establish(&mut self, startup: bool) -> Result<(), SessionError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut failed_attempts = 0u32;
        let mut last_error = String::new();

        loop {
            if failed_attempts > 0 {
                let shutdown = *shutdown_rx.borrow();
                match self
                    .reconnect
                    .next_attempt(failed_attempts, startup, shutdown)
                {
                    ReconnectionDecision::Proceed { attempt, delay } => {
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Scheduling reconnection attempt"
                        );
                        if !interruptible_sleep(&mut shutdown_rx, delay).await {
                            return Err(SessionError::Closed);
                        }
                    }
                    ReconnectionDecision::AbortShutdownRequested => {
                        return Err(SessionError::Closed);
                    }
                    ReconnectionDecision::AbortMaxAttemptsExceeded => {
                        error!(
                            attempts = failed_attempts,
                            "Maximum connection attempts exceeded"
                        );
                        return Err(SessionError::Connection {
                            attempts: failed_attempts,
                            reason: last_error,
                        });
                    }
                }
            }

            if *shutdown_rx.borrow() {
                return Err(SessionError::Closed);
            }

            self.observe(ConnectivityState::Connecting).await;
            match self.connect_and_recover().await {
                Ok(session_present) => {
                    self.observe(ConnectivityState::Up).await;
                    self.dispatch(&SessionEvent::SessionEstablished { session_present })
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    failed_attempts += 1;
                    last_error = e.to_string();
                    self.observe(ConnectivityState::Down).await;

                    match permanent_cause(&e) {
                        Some(cause) if startup => {
                            error!("Startup connect failed permanently: {}", cause);
                            return Err(SessionError::Connection {
                                attempts: failed_attempts,
                                reason: last_error,
                            });
                        }
                        Some(cause) => {
                            error!(
                                attempt = failed_attempts,
                                "Broker keeps refusing the session, retrying: {}: {}", e, cause
                            );
                        }
                        None => {
                            warn!(attempt = failed_attempts, "Connection attempt failed: {}", e)
                        }
                    }
                }
            }
        }
    }

    /// One connect sequence; returns the broker's session-present flag
    async fn connect_and_recover(&mut self) -> Result<bool, SessionError> {
        let handshake = self.link.open(&self.options).await?;
        debug!(
            session_present = handshake.session_present,
            "Broker accepted connection"
        );
        self.recovery.recover(&mut self.link).await?;
        Ok(handshake.session_present)
    }

    /// Report Down, reconnect and requeue whatever was pending.
    /// Returns false if the session is shutting down.
    async fn recover_link(&mut self, shutdown_rx: &mut watch::Receiver<bool>, cause: LinkError) -> bool {
        warn!("Broker link failed: {}", cause);
        self.observe(ConnectivityState::Down).await;

        let result = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown_rx) => return false,
            result = self.establish(false) => result,
        };

        match result {
            Ok(()) => {
                self.drain_intake();
                let mut pending = 0usize;
                for command in self.queue.iter_mut() {
                    if let Command::Publish {
                        message,
                        redelivery,
                        ..
                    } = command
                    {
                        if message.qos == QoS::AtLeastOnce {
                            *redelivery = true;
                            pending += 1;
                        }
                    }
                }
                if pending > 0 {
                    info!(pending, "Republishing messages held during outage");
                }
                true
            }
            Err(e) => {
                debug!("Reconnection abandoned: {}", e);
                false
            }
        }
    }

    /// Work on the oldest request. A transport failure leaves it queued.
    async fn execute_front(&mut self) -> Result<(), LinkError> {
        let Some(command) = self.queue.front_mut() else {
            return Ok(());
        };

        let result = match command {
            Command::Publish { message, sent, .. } => {
                message.dup = *sent && message.qos == QoS::AtLeastOnce;
                *sent = true;
                self.link.publish(message).await
            }
            Command::Subscribe { subscription, .. } => {
                if self.recovery.add(subscription.clone()) {
                    self.link.subscribe(subscription).await
                } else {
                    // Already established, possibly by a recovery pass
                    Ok(())
                }
            }
        };

        match result {
            Ok(()) => {
                if let Some(command) = self.queue.pop_front() {
                    self.complete(command);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => {
                if let Some(command) = self.queue.pop_front() {
                    if let Command::Subscribe { subscription, .. } = &command {
                        self.recovery.remove(&subscription.topic);
                    }
                    warn!("Request rejected: {}", e);
                    command.fail(|| SessionError::FatalProtocol(e.to_string()));
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn complete(&self, command: Command) {
        match command {
            Command::Publish {
                message,
                ack,
                redelivery,
                ..
            } => {
                if redelivery {
                    self.republished.increment();
                }
                debug!(topic = %message.topic, qos = %message.qos, redelivery, "Publish acknowledged");
                let _ = ack.send(Ok(()));
            }
            Command::Subscribe { subscription, ack } => {
                debug!(topic = %subscription.topic, "Subscription added");
                let _ = ack.send(Ok(()));
            }
        }
    }

    fn drain_intake(&mut self) {
        while let Ok(command) = self.intake.try_recv() {
            self.queue.push_back(command);
        }
    }

    /// Run the handlers; they are abandoned once shutdown is requested
    async fn dispatch(&mut self, event: &SessionEvent) {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => {
                debug!(event = event.kind(), "Handlers skipped, session is closing");
            }
            _ = self.handlers.dispatch(event) => {}
        }
    }

    async fn observe(&mut self, state: ConnectivityState) {
        if let Some(link_state) = self.monitor.observe(state) {
            self.dispatch(&SessionEvent::Connectivity(link_state)).await;
        }
    }

    /// Fail everything pending and release the link
    async fn finish(&mut self) {
        self.intake.close();
        self.drain_intake();
        let abandoned = self.queue.len();
        for command in self.queue.drain(..) {
            command.fail(|| SessionError::Closed);
        }
        if abandoned > 0 {
            warn!(abandoned, "Pending requests abandoned at shutdown");
        }

        self.link.close().await;
        self.monitor.shut_down();
    }
}
