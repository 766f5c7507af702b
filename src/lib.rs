//! Resilient MQTT telemetry publisher
//!
//! Keeps a persistent-session connection to a broker over an unreliable link,
//! carries at-least-once messages across outages and reports how many outages
//! and redeliveries it has seen.
//!
//! # Overview
//!
//! - [`transport`] - the [`transport::BrokerLink`] seam and its rumqttc implementation
//! - [`session`] - connectivity state, subscription recovery, reconnection and the
//!   session driver
//! - [`tasks`] - the heartbeat and the telemetry publisher
//! - [`app`] - wiring with a guaranteed `close` on every exit path
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use telemetry_publisher::session::Session;
//! use telemetry_publisher::transport::mqtt::{BrokerAddress, RumqttLink};
//! use telemetry_publisher::transport::{QoS, SessionOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = BrokerAddress::parse("mqtt://localhost:1883")?;
//! let link = RumqttLink::new(broker, 256 * 1024, Duration::from_secs(10));
//! let options = SessionOptions {
//!     client_id: "telemetry-example".to_string(),
//!     clean_session: false,
//!     keepalive: Duration::from_secs(120),
//!     will: None,
//! };
//!
//! let mut session = Session::new(options, link);
//! session.connect().await?;
//! session.handle().publish("result", "hello", QoS::AtLeastOnce).await?;
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod indicator;
pub mod observability;
pub mod session;
pub mod tasks;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, PublisherConfig};
pub use error::{AppError, AppResult};
pub use session::{Session, SessionError, SessionHandle, SessionStats};
