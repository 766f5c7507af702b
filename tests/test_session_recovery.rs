//! Session recovery integration tests
//!
//! Subscriptions are replayed on every (re)connection before the session is
//! reported Up, a failed replay restarts the whole connect sequence, and the
//! broker's persistent session carries inbound traffic across outages.


use std::time::Duration;
use telemetry_publisher::session::{
    HandlerRegistry, LinkState, Session, SessionError, SessionEvent,
};
use telemetry_publisher::testing::mocks::{BrokerEvent, MockBroker, RecordingHandler};
use telemetry_publisher::transport::{QoS, Subscription};
use test_helpers::{fast_reconnect, session_options, subscribed_session};

fn connected_events(journal: &[BrokerEvent]) -> usize {
    journal
        .iter()
        .filter(|event| matches!(event, BrokerEvent::Connected { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_failed_resubscription_restarts_connect() {
    // Arrange
    let broker = MockBroker::new();
    let recorder = RecordingHandler::new();
    let mut session = subscribed_session(&broker)
        .with_handlers(HandlerRegistry::default().register(recorder.clone()));
    session.connect().await.unwrap();
    let handle = session.handle();

    // Act: lose the link, queue a publish, and make the first replay fail
    broker.set_reachable(false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let ack = handle.submit("result", "after recovery", QoS::AtLeastOnce).unwrap();
    broker.fail_next_subscriptions(1).await;
    broker.set_reachable(true).await;
    ack.wait().await.unwrap();

    // Assert
    let journal = broker.journal().await;
    assert_eq!(connected_events(&journal), 3);

    // The publish follows a completed replay on the final connection
    let published = journal
        .iter()
        .position(|event| matches!(event, BrokerEvent::Published { .. }))
        .unwrap();
    let last_connect = journal
        .iter()
        .rposition(|event| matches!(event, BrokerEvent::Connected { .. }))
        .unwrap();
    assert!(last_connect < published);
    assert!(journal[last_connect..published]
        .iter()
        .any(|event| matches!(event, BrokerEvent::Subscribed { .. })));

    // The aborted recovery was never reported as Up
    let ups = recorder
        .events()
        .await
        .into_iter()
        .filter(|event| *event == SessionEvent::Connectivity(LinkState::Up))
        .count();
    assert_eq!(ups, 2);
    assert_eq!(handle.stats().outages, 1);

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_startup_recovery_failure_is_retried() {
    let broker = MockBroker::new();
    broker.fail_next_subscriptions(1).await;
    let mut session = subscribed_session(&broker);

    session.connect().await.unwrap();

    assert_eq!(broker.opens().await, 2);
    assert_eq!(session.stats().outages, 0);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_persistent_session_delivers_messages_queued_during_outage() {
    // Arrange
    let broker = MockBroker::new();
    let recorder = RecordingHandler::new();
    let mut session = subscribed_session(&broker)
        .with_handlers(HandlerRegistry::default().register(recorder.clone()));
    session.connect().await.unwrap();

    // Act
    broker.set_reachable(false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.inject("foo_topic", "while away", QoS::AtLeastOnce).await, 1);
    broker.set_reachable(true).await;
    session.handle().wait_until_up().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Assert
    let events = recorder.events().await;
    let established = events
        .iter()
        .rposition(|event| matches!(event, SessionEvent::SessionEstablished { session_present: true }))
        .unwrap();
    let received = events
        .iter()
        .position(|event| matches!(event, SessionEvent::Message(_)))
        .unwrap();
    assert!(established < received);
    match &events[received] {
        SessionEvent::Message(message) => {
            assert_eq!(message.topic, "foo_topic");
            assert_eq!(&message.payload[..], b"while away");
        }
        other => panic!("unexpected event {other:?}"),
    }

    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_clean_session_loses_messages_sent_during_outage() {
    let broker = MockBroker::new();
    let recorder = RecordingHandler::new();
    let mut session = Session::new(session_options(true), broker.link())
        .with_reconnect(fast_reconnect())
        .with_subscriptions(vec![Subscription::new("foo_topic", QoS::AtLeastOnce)])
        .with_handlers(HandlerRegistry::default().register(recorder.clone()));
    session.connect().await.unwrap();

    broker.set_reachable(false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.inject("foo_topic", "lost", QoS::AtLeastOnce).await, 0);
    broker.set_reachable(true).await;
    session.handle().wait_until_up().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!recorder
        .events()
        .await
        .iter()
        .any(|event| matches!(event, SessionEvent::Message(_))));

    // Subscriptions are still replayed on the fresh session
    assert_eq!(broker.inject("foo_topic", "live", QoS::AtLeastOnce).await, 1);
    session.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_subscription_added_at_runtime_survives_reconnect() {
    let broker = MockBroker::new();
    let mut session = subscribed_session(&broker);
    session.connect().await.unwrap();
    session.subscribe("sensors/+/temp", QoS::AtMostOnce).await.unwrap();

    broker.set_reachable(false).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.set_reachable(true).await;
    session.handle().wait_until_up().await.unwrap();

    let last_connect = broker
        .journal()
        .await
        .into_iter()
        .rev()
        .take_while(|event| !matches!(event, BrokerEvent::Connected { .. }))
        .filter_map(|event| match event {
            BrokerEvent::Subscribed { topic } => Some(topic),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(last_connect, vec!["sensors/+/temp", "foo_topic"]);

    session.close().await;
}

#[tokio::test]
async fn test_invalid_subscription_filter_is_fatal() {
    let broker = MockBroker::new();
    let mut session = subscribed_session(&broker);
    session.connect().await.unwrap();

    let result = session.subscribe("sensors/#/temp", QoS::AtLeastOnce).await;

    assert!(matches!(result, Err(SessionError::FatalProtocol(_))));
    session.close().await;
}
