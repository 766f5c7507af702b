//! Independent periodic tasks sharing one session
//!
//! - [`heartbeat`] - liveness toggle, no transport dependency
//! - [`publisher`] - telemetry publishing at QoS 1

pub mod heartbeat;
pub mod publisher;

pub use heartbeat::{Heartbeat, DEFAULT_HEARTBEAT_PERIOD};
pub use publisher::{
    FatalPublishPolicy, PayloadComposer, PayloadFormat, PublisherError, StatsPayload,
    TelemetryPublisher, DEFAULT_PUBLISH_PERIOD,
};
