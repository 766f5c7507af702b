//! Application wiring
//!
//! Builds the session, heartbeat and publisher from a [`PublisherConfig`] and
//! runs them until a shutdown signal or a fatal error. The session is closed on
//! every way out of [`App::run`], including a failed startup connect.

use crate::config::PublisherConfig;
use crate::error::{AppError, AppResult};
use crate::indicator::{Indicator, LinkIndicator, TracingIndicator};
use crate::session::{
    HandlerRegistry, Session, SessionEvent, SessionHandler, SessionStats,
};
use crate::tasks::{Heartbeat, StatsPayload, TelemetryPublisher};
use crate::transport::mqtt::RumqttLink;
use crate::transport::BrokerLink;
use crate::session_span;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, Instrument};

/// Logs every message received on a subscribed topic
#[derive(Debug, Default)]
pub struct MessageLogger;

#[async_trait::async_trait]
impl SessionHandler for MessageLogger {
    async fn handle(&self, event: &SessionEvent) {
        match event {
            SessionEvent::Message(message) => {
                info!(
                    topic = %message.topic,
                    qos = %message.qos,
                    retained = message.retained,
                    payload = %String::from_utf8_lossy(&message.payload),
                    "Message received"
                );
            }
            SessionEvent::SessionEstablished { session_present } => {
                info!(session_present, "Broker session ready");
            }
            SessionEvent::Connectivity(_) => {}
        }
    }
}

pub struct App {
    config: PublisherConfig,
    heartbeat_indicator: Arc<dyn Indicator>,
    link_indicator: Arc<dyn Indicator>,
    handlers: Vec<Arc<dyn SessionHandler>>,
}

impl App {
    pub fn new(config: PublisherConfig) -> Self {
        Self {
            config,
            heartbeat_indicator: Arc::new(TracingIndicator::new("heartbeat")),
            link_indicator: Arc::new(TracingIndicator::new("link")),
            handlers: Vec::new(),
        }
    }

    pub fn with_indicators(
        mut self,
        heartbeat: Arc<dyn Indicator>,
        link: Arc<dyn Indicator>,
    ) -> Self {
        self.heartbeat_indicator = heartbeat;
        self.link_indicator = link;
        self
    }

    /// Register an extra handler, invoked after the built-in ones
    pub fn with_handler(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    fn build_session<L: BrokerLink>(&self, link: L) -> Session<L> {
        let mut registry = HandlerRegistry::new(self.config.handler_deadline())
            .register(LinkIndicator::new(
                self.link_indicator.clone(),
                self.config.settle_delay(),
            ))
            .register(MessageLogger);
        for handler in &self.handlers {
            registry = registry.register_shared(handler.clone());
        }

        Session::new(self.config.session_options(), link)
            .with_reconnect(self.config.reconnect.clone())
            .with_subscriptions(self.config.subscriptions.clone())
            .with_handlers(registry)
            .with_max_packet_size(self.config.session.max_packet_size)
    }

    fn build_publisher(&self, session: &Session<impl BrokerLink>) -> TelemetryPublisher {
        let settings = &self.config.publisher;
        TelemetryPublisher::new(session.handle(), settings.topic.clone(), self.config.publish_period())
            .with_qos(settings.qos)
            .with_max_in_flight(settings.max_in_flight)
            .with_fatal_policy(settings.on_fatal)
            .with_composer(StatsPayload::new(settings.format))
    }

    /// Run against the broker named in the configuration
    pub async fn run_mqtt<S>(self, shutdown: S) -> AppResult<SessionStats>
    where
        S: Future<Output = ()>,
    {
        let link = RumqttLink::new(
            self.config.broker_address()?,
            self.config.session.max_packet_size,
            self.config.connect_timeout(),
        );
        self.run(link, shutdown).await
    }

    /// Run until `shutdown` resolves or a fatal error occurs.
    ///
    /// Returns the final session statistics.
    pub async fn run<L, S>(self, link: L, shutdown: S) -> AppResult<SessionStats>
    where
        L: BrokerLink,
        S: Future<Output = ()>,
    {
        let options = self.config.session_options();
        let span = session_span!(client_id = %options.client_id);

        async move {
            let mut session = self.build_session(link);

            // The heartbeat runs from the start, even while the first connect retries
            let heartbeat =
                Heartbeat::new(self.config.heartbeat_period(), self.heartbeat_indicator.clone())
                    .spawn();

            tokio::pin!(shutdown);
            let outcome = self.drive(&mut session, shutdown).await;

            session.close().await;
            heartbeat.abort();

            let stats = session.stats();
            outcome.map(|()| stats)
        }
        .instrument(span)
        .await
    }

    async fn drive<L, S>(
        &self,
        session: &mut Session<L>,
        mut shutdown: std::pin::Pin<&mut S>,
    ) -> AppResult<()>
    where
        L: BrokerLink,
        S: Future<Output = ()>,
    {
        info!(broker = %self.config.session.broker_url, "Connecting to broker");
        tokio::select! {
            _ = shutdown.as_mut() => {
                info!("Shutdown requested before the session came up");
                return Ok(());
            }
            result = session.connect() => result?,
        }

        let publisher = self.build_publisher(session);
        tokio::select! {
            _ = shutdown.as_mut() => {
                info!("Shutdown requested");
                Ok(())
            }
            result = publisher.run() => result.map_err(AppError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{MockBroker, RecordingIndicator};
    use std::time::Duration;

    fn config() -> PublisherConfig {
        let mut config = PublisherConfig::from_toml(
            r#"
[session]
broker_url = "mqtt://localhost:1883"
client_id = "app-test"

[[subscriptions]]
topic = "foo_topic"
qos = 1

[publisher]
period_secs = 1

[connectivity]
settle_ms = 0
"#,
        )
        .unwrap();
        config.reconnect.initial_attempts = Some(2);
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_publishes_until_shutdown() {
        let broker = MockBroker::new();
        let app = App::new(config());

        let stats = app
            .run(broker.link(), tokio::time::sleep(Duration::from_millis(3500)))
            .await
            .unwrap();

        assert_eq!(
            broker.delivered_payloads().await,
            vec![
                "0 repubs: 0 outages: 0",
                "1 repubs: 0 outages: 0",
                "2 repubs: 0 outages: 0"
            ]
        );
        assert_eq!(stats.outages, 0);
        assert_eq!(broker.closes().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_failure_still_closes() {
        let broker = MockBroker::new();
        broker.set_reachable(false).await;
        let heartbeat = RecordingIndicator::new();
        let link = RecordingIndicator::new();
        let mut config = config();
        config.reconnect.initial_attempts = Some(3);
        let app = App::new(config)
            .with_indicators(Arc::new(heartbeat.clone()), Arc::new(link.clone()));

        let result = app.run(broker.link(), std::future::pending()).await;

        assert!(matches!(
            result,
            Err(AppError::Session(crate::session::SessionError::Connection { .. }))
        ));
        assert_eq!(broker.closes().await, 1);
        assert!(!link.is_on());
        // The heartbeat kept going through the 1.5 s of retry delays
        assert!(heartbeat.changes() >= 2);
    }

    #[tokio::test]
    async fn test_message_logger_ignores_connectivity() {
        MessageLogger
            .handle(&SessionEvent::Connectivity(crate::session::LinkState::Up))
            .await;
    }
}
