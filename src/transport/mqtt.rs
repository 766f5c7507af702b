//! MQTT 3.1.1 broker link backed by rumqttc
//!
//! Every `open` builds a fresh `AsyncClient`/`EventLoop` pair with the same
//! client identifier, so the broker resumes the persistent session instead of
//! rumqttc silently reconnecting underneath the session driver. Acknowledgments
//! (ConnAck, SubAck, PubAck) are awaited by polling the event loop; publishes
//! that arrive meanwhile are buffered for `next_inbound`.

use super::{
    BrokerLink, InboundMessage, LinkError, LinkHandshake, OutboundMessage, QoS, SessionOptions,
    Subscription,
};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Request, StateError, SubscribeReasonCode, Transport as RumqttcTransport,
};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// How long `close` keeps polling to flush the DISCONNECT packet
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

/// Broker endpoint parsed from an `mqtt://` or `mqtts://` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    pub fn parse(broker_url: &str) -> Result<Self, LinkError> {
        let url =
            Url::parse(broker_url).map_err(|_| LinkError::InvalidBrokerUrl(broker_url.to_string()))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            _ => return Err(LinkError::InvalidBrokerUrl(broker_url.to_string())),
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| LinkError::InvalidBrokerUrl(broker_url.to_string()))?;
        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

fn from_rumqttc_qos(qos: rumqttc::QoS) -> QoS {
    match qos {
        rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
        // QoS 2 deliveries are surfaced as at-least-once; the session never requests it
        rumqttc::QoS::AtLeastOnce | rumqttc::QoS::ExactlyOnce => QoS::AtLeastOnce,
    }
}

/// Classify an event loop failure. An oversized packet fails again on every
/// connection, so it is reported as malformed rather than as a dropped link.
fn link_error(error: ConnectionError) -> LinkError {
    match error {
        ConnectionError::MqttState(StateError::OutgoingPacketTooLarge { pkt_size, max }) => {
            LinkError::Malformed(format!(
                "packet of {pkt_size} bytes exceeds maximum packet size {max}"
            ))
        }
        other => LinkError::Dropped(other.to_string()),
    }
}

/// Explicit PUBLISH packet for a resend, carrying the DUP flag
fn redelivery_request(message: &OutboundMessage) -> Request {
    let mut publish = rumqttc::Publish::new(
        message.topic.clone(),
        message.qos.into(),
        message.payload.to_vec(),
    );
    publish.retain = message.retain;
    publish.dup = message.dup;
    Request::Publish(publish)
}

/// Build rumqttc options for one connect attempt
pub fn configure_mqtt_options(
    options: &SessionOptions,
    broker: &BrokerAddress,
    max_packet_size: usize,
) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(options.client_id.clone(), broker.host.clone(), broker.port);

    if broker.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    mqtt_options.set_keep_alive(options.keepalive);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_max_packet_size(max_packet_size, max_packet_size);

    if let Some(will) = &options.will {
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            will.topic.clone(),
            will.payload.to_vec(),
            will.qos.into(),
            will.retain,
        ));
    }

    mqtt_options
}

/// Production [`BrokerLink`] speaking MQTT 3.1.1 through rumqttc
pub struct RumqttLink {
    broker: BrokerAddress,
    max_packet_size: usize,
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    inbound: VecDeque<InboundMessage>,
}

impl RumqttLink {
    pub fn new(broker: BrokerAddress, max_packet_size: usize, connect_timeout: Duration) -> Self {
        Self {
            broker,
            max_packet_size,
            connect_timeout,
            client: None,
            event_loop: None,
            inbound: VecDeque::new(),
        }
    }

    fn client(&self) -> Result<&AsyncClient, LinkError> {
        self.client.as_ref().ok_or(LinkError::NotOpen)
    }

    /// Poll the event loop until `matcher` accepts an event.
    ///
    /// Incoming publishes are buffered whatever the matcher decides.
    async fn poll_until<T, F>(&mut self, mut matcher: F) -> Result<T, LinkError>
    where
        F: FnMut(&Event) -> Option<Result<T, LinkError>>,
    {
        let Self {
            event_loop,
            inbound,
            ..
        } = self;
        let event_loop = event_loop.as_mut().ok_or(LinkError::NotOpen)?;

        loop {
            let event = event_loop.poll().await.map_err(link_error)?;

            match &event {
                Event::Incoming(Packet::Publish(publish)) => {
                    inbound.push_back(InboundMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.clone(),
                        qos: from_rumqttc_qos(publish.qos),
                        retained: publish.retain,
                    });
                }
                Event::Incoming(Packet::Disconnect) => {
                    return Err(LinkError::Dropped("broker sent DISCONNECT".to_string()));
                }
                _ => {}
            }

            if let Some(result) = matcher(&event) {
                return result;
            }
        }
    }

    fn drop_connection(&mut self) {
        self.client = None;
        self.event_loop = None;
    }
}

#[async_trait::async_trait]
impl BrokerLink for RumqttLink {
    async fn open(&mut self, options: &SessionOptions) -> Result<LinkHandshake, LinkError> {
        // Buffered publishes were already acknowledged to the broker and must
        // still reach the driver after a reconnect
        self.drop_connection();

        let mqtt_options = configure_mqtt_options(options, &self.broker, self.max_packet_size);
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
        self.client = Some(client);
        self.event_loop = Some(event_loop);

        debug!(
            target: "mqtt_transport",
            host = %self.broker.host,
            port = self.broker.port,
            client_id = %options.client_id,
            clean_session = options.clean_session,
            "Opening broker connection"
        );

        let connect_timeout = self.connect_timeout;
        let handshake = tokio::time::timeout(
            connect_timeout,
            self.poll_until(|event| match event {
                Event::Incoming(Packet::ConnAck(ack)) => Some(match ack.code {
                    ConnectReturnCode::Success => Ok(LinkHandshake {
                        session_present: ack.session_present,
                    }),
                    code => Err(LinkError::Refused(format!("{code:?}"))),
                }),
                _ => None,
            }),
        )
        .await;

        let result = match handshake {
            Ok(result) => result.map_err(|e| match e {
                LinkError::Dropped(reason) => LinkError::Unreachable(reason),
                other => other,
            }),
            Err(_) => Err(LinkError::Unreachable(format!(
                "no ConnAck within {connect_timeout:?}"
            ))),
        };

        match &result {
            Ok(handshake) => info!(
                session_present = handshake.session_present,
                "Broker accepted connection"
            ),
            Err(_) => self.drop_connection(),
        }
        result
    }

    async fn subscribe(&mut self, subscription: &Subscription) -> Result<(), LinkError> {
        self.client()?
            .subscribe(subscription.topic.clone(), subscription.qos.into())
            .await
            .map_err(|e| LinkError::Dropped(e.to_string()))?;

        let topic = subscription.topic.clone();
        let result = self
            .poll_until(|event| match event {
                Event::Incoming(Packet::SubAck(suback)) => Some(
                    if suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        Err(LinkError::SubscriptionRejected {
                            topic: topic.clone(),
                        })
                    } else {
                        Ok(())
                    },
                ),
                _ => None,
            })
            .await;

        if let Err(LinkError::Dropped(_)) = &result {
            self.drop_connection();
        }
        result
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), LinkError> {
        let packet_size = message.encoded_size();
        if packet_size > self.max_packet_size {
            return Err(LinkError::Malformed(format!(
                "packet of {} bytes exceeds maximum packet size {}",
                packet_size, self.max_packet_size
            )));
        }

        if message.dup {
            // AsyncClient::publish always clears DUP; queue the packet directly
            let event_loop = self.event_loop.as_mut().ok_or(LinkError::NotOpen)?;
            event_loop.pending.push_back(redelivery_request(message));
        } else {
            self.client()?
                .publish(
                    message.topic.clone(),
                    message.qos.into(),
                    message.retain,
                    message.payload.to_vec(),
                )
                .await
                .map_err(|e| LinkError::Dropped(e.to_string()))?;
        }

        let qos = message.qos;
        let result = self
            .poll_until(|event| match (qos, event) {
                (QoS::AtMostOnce, Event::Outgoing(Outgoing::Publish(_))) => Some(Ok(())),
                (QoS::AtLeastOnce, Event::Incoming(Packet::PubAck(_))) => Some(Ok(())),
                _ => None,
            })
            .await;

        if let Err(e) = &result {
            if !e.is_fatal() {
                self.drop_connection();
            }
        }
        result
    }

    async fn next_inbound(&mut self) -> Result<InboundMessage, LinkError> {
        if let Some(message) = self.inbound.pop_front() {
            return Ok(message);
        }

        let result = self
            .poll_until(|event| match event {
                Event::Incoming(Packet::Publish(_)) => Some(Ok(())),
                _ => None,
            })
            .await;

        match result {
            Ok(()) => self.inbound.pop_front().ok_or(LinkError::NotOpen),
            Err(e) => {
                self.drop_connection();
                Err(e)
            }
        }
    }

    async fn close(&mut self) {
        let Some(client) = self.client.take() else {
            self.event_loop = None;
            return;
        };

        if let Err(e) = client.disconnect().await {
            warn!("Failed to queue DISCONNECT: {}", e);
        } else {
            let flushed = tokio::time::timeout(
                DISCONNECT_FLUSH_TIMEOUT,
                self.poll_until(|event| match event {
                    Event::Outgoing(Outgoing::Disconnect) => Some(Ok(())),
                    _ => None,
                }),
            )
            .await;
            if !matches!(flushed, Ok(Ok(()))) {
                debug!("DISCONNECT not flushed before close");
            }
        }

        self.event_loop = None;
        self.inbound.clear();
        info!("Broker link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_options() -> SessionOptions {
        SessionOptions {
            client_id: "telemetry-test".to_string(),
            clean_session: false,
            keepalive: Duration::from_secs(120),
            will: Some(super::super::LastWill {
                topic: "result".to_string(),
                payload: Bytes::from_static(b"Goodbye cruel world!"),
                retain: false,
                qos: QoS::AtMostOnce,
            }),
        }
    }

    #[test]
    fn test_broker_address_parse() {
        let address = BrokerAddress::parse("mqtt://192.168.0.9").unwrap();
        assert_eq!(address.host, "192.168.0.9");
        assert_eq!(address.port, 1883);
        assert!(!address.tls);

        let address = BrokerAddress::parse("mqtts://broker.example.com").unwrap();
        assert_eq!(address.port, 8883);
        assert!(address.tls);

        let address = BrokerAddress::parse("mqtt://localhost:1884").unwrap();
        assert_eq!(address.port, 1884);
    }

    #[test]
    fn test_broker_address_rejects_invalid_urls() {
        assert!(matches!(
            BrokerAddress::parse("invalid-url"),
            Err(LinkError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            BrokerAddress::parse("http://localhost:1883"),
            Err(LinkError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options_keeps_session_identity() {
        let broker = BrokerAddress::parse("mqtt://localhost:1883").unwrap();
        let options = configure_mqtt_options(&test_options(), &broker, 256 * 1024);

        assert_eq!(options.client_id(), "telemetry-test");
        assert!(!options.clean_session());
        assert_eq!(options.keep_alive(), Duration::from_secs(120));
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));

        let will = options.last_will().expect("will should be configured");
        assert_eq!(will.topic, "result");
        assert_eq!(&will.message[..], b"Goodbye cruel world!");
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(
            rumqttc::QoS::from(QoS::AtLeastOnce),
            rumqttc::QoS::AtLeastOnce
        );
        assert_eq!(from_rumqttc_qos(rumqttc::QoS::AtMostOnce), QoS::AtMostOnce);
        assert_eq!(from_rumqttc_qos(rumqttc::QoS::ExactlyOnce), QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_operations_fail_before_open() {
        let broker = BrokerAddress::parse("mqtt://localhost:1883").unwrap();
        let mut link = RumqttLink::new(broker, 1024, Duration::from_millis(50));

        let result = link
            .subscribe(&Subscription::new("foo_topic", QoS::AtLeastOnce))
            .await;
        assert!(matches!(result, Err(LinkError::NotOpen)));

        let result = link.next_inbound().await;
        assert!(matches!(result, Err(LinkError::NotOpen)));

        // Closing a link that never opened is a no-op
        link.close().await;
    }

    #[test]
    fn test_packet_too_large_is_malformed() {
        let error = link_error(ConnectionError::MqttState(
            StateError::OutgoingPacketTooLarge {
                pkt_size: 70,
                max: 64,
            },
        ));
        assert!(matches!(error, LinkError::Malformed(_)));
        assert!(error.is_fatal());

        let error = link_error(ConnectionError::NetworkTimeout);
        assert!(matches!(error, LinkError::Dropped(_)));
    }

    #[test]
    fn test_redelivery_request_sets_dup() {
        let message = OutboundMessage {
            topic: "result".to_string(),
            payload: Bytes::from_static(b"3 repubs: 0 outages: 1"),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: true,
        };

        match redelivery_request(&message) {
            Request::Publish(publish) => {
                assert!(publish.dup);
                assert_eq!(publish.topic, "result");
                assert_eq!(publish.qos, rumqttc::QoS::AtLeastOnce);
                assert_eq!(&publish.payload[..], b"3 repubs: 0 outages: 1");
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_buffered_inbound_survives_reopen() {
        // Arrange: a message rumqttc already acknowledged before the link dropped
        let broker = BrokerAddress::parse("mqtt://127.0.0.1:1").unwrap();
        let mut link = RumqttLink::new(broker, 1024, Duration::from_millis(200));
        link.inbound.push_back(InboundMessage {
            topic: "foo_topic".to_string(),
            payload: Bytes::from_static(b"acked before the drop"),
            qos: QoS::AtLeastOnce,
            retained: false,
        });

        // Act
        let reopened = link.open(&test_options()).await;
        let message = link.next_inbound().await;

        // Assert
        assert!(reopened.is_err());
        let message = message.unwrap();
        assert_eq!(message.topic, "foo_topic");
        assert_eq!(&message.payload[..], b"acked before the drop");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_malformed() {
        let broker = BrokerAddress::parse("mqtt://localhost:1883").unwrap();
        let mut link = RumqttLink::new(broker, 64, Duration::from_millis(50));

        let result = link
            .publish(&OutboundMessage {
                topic: "result".to_string(),
                payload: Bytes::from(vec![b'x'; 60]),
                qos: QoS::AtLeastOnce,
                retain: false,
                dup: false,
            })
            .await;
        assert!(matches!(result, Err(LinkError::Malformed(_))));
    }
}
