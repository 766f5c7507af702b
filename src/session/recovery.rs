//! Session recovery after (re)connection
//!
//! Broker-side subscription state is not guaranteed to survive a reconnect the
//! way queued messages do, so every configured subscription is issued again
//! before the session is reported Up.

use super::error::SessionError;
use crate::transport::{BrokerLink, Subscription};
use tracing::{debug, info};

/// Summary of one successful recovery pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resubscribed: usize,
}

/// Re-applies the subscription set on every new connection
#[derive(Debug, Clone, Default)]
pub struct RecoveryCoordinator {
    subscriptions: Vec<Subscription>,
}

impl RecoveryCoordinator {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        let mut coordinator = Self::default();
        for subscription in subscriptions {
            coordinator.add(subscription);
        }
        coordinator
    }

    /// Add a subscription; an existing filter is updated in place.
    ///
    /// Returns false if the exact subscription was already present.
    pub fn add(&mut self, subscription: Subscription) -> bool {
        match self
            .subscriptions
            .iter_mut()
            .find(|existing| existing.topic == subscription.topic)
        {
            Some(existing) if existing.qos == subscription.qos => false,
            Some(existing) => {
                existing.qos = subscription.qos;
                true
            }
            None => {
                self.subscriptions.push(subscription);
                true
            }
        }
    }

    /// Forget a subscription, e.g. one the broker rejected
    pub fn remove(&mut self, topic: &str) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|existing| existing.topic != topic);
        self.subscriptions.len() != before
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    /// Re-issue every subscription, waiting for each acknowledgment.
    ///
    /// Stops at the first failure; the caller must reconnect from scratch.
    pub async fn recover<L>(&self, link: &mut L) -> Result<RecoveryReport, SessionError>
    where
        L: BrokerLink + ?Sized,
    {
        for subscription in &self.subscriptions {
            link.subscribe(subscription)
                .await
                .map_err(|source| SessionError::Handshake {
                    topic: subscription.topic.clone(),
                    source,
                })?;
            debug!(
                target: "mqtt_transport",
                topic = %subscription.topic,
                qos = %subscription.qos,
                "Re-subscribed"
            );
        }

        if !self.subscriptions.is_empty() {
            info!(
                count = self.subscriptions.len(),
                "Subscriptions re-established"
            );
        }
        Ok(RecoveryReport {
            resubscribed: self.subscriptions.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::{BrokerEvent, MockBroker};
    use crate::transport::{QoS, SessionOptions};
    use std::time::Duration;

    fn options() -> SessionOptions {
        SessionOptions {
            client_id: "recovery-test".to_string(),
            clean_session: false,
            keepalive: Duration::from_secs(60),
            will: None,
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut coordinator = RecoveryCoordinator::new(vec![
            Subscription::new("foo_topic", QoS::AtLeastOnce),
            Subscription::new("foo_topic", QoS::AtLeastOnce),
        ]);
        assert_eq!(coordinator.subscriptions().len(), 1);

        assert!(!coordinator.add(Subscription::new("foo_topic", QoS::AtLeastOnce)));
        assert!(coordinator.add(Subscription::new("foo_topic", QoS::AtMostOnce)));
        assert_eq!(coordinator.subscriptions()[0].qos, QoS::AtMostOnce);
        assert!(coordinator.add(Subscription::new("bar_topic", QoS::AtMostOnce)));
        assert_eq!(coordinator.subscriptions().len(), 2);

        assert!(coordinator.remove("bar_topic"));
        assert!(!coordinator.remove("bar_topic"));
        assert_eq!(coordinator.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_subscribes_everything() {
        let broker = MockBroker::new();
        let mut link = broker.link();
        link.open(&options()).await.unwrap();

        let coordinator = RecoveryCoordinator::new(vec![
            Subscription::new("foo_topic", QoS::AtLeastOnce),
            Subscription::new("sensors/#", QoS::AtMostOnce),
        ]);
        let report = coordinator.recover(&mut link).await.unwrap();

        assert_eq!(report.resubscribed, 2);
        let subscribed: Vec<_> = broker
            .journal()
            .await
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Subscribed { topic } => Some(topic),
                _ => None,
            })
            .collect();
        assert_eq!(subscribed, vec!["foo_topic", "sensors/#"]);
    }

    #[tokio::test]
    async fn test_recover_aborts_on_handshake_failure() {
        let broker = MockBroker::new();
        let mut link = broker.link();
        link.open(&options()).await.unwrap();
        broker.fail_next_subscriptions(1).await;

        let coordinator = RecoveryCoordinator::new(vec![
            Subscription::new("foo_topic", QoS::AtLeastOnce),
            Subscription::new("bar_topic", QoS::AtLeastOnce),
        ]);
        let result = coordinator.recover(&mut link).await;

        match result {
            Err(SessionError::Handshake { topic, .. }) => assert_eq!(topic, "foo_topic"),
            other => panic!("expected handshake error, got {other:?}"),
        }
        assert!(!broker
            .journal()
            .await
            .iter()
            .any(|event| matches!(event, BrokerEvent::Subscribed { .. })));
    }
}
