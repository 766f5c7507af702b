//! Broker session management
//!
//! - [`connectivity`] - Down/Connecting/Up state machine and outage counting
//! - [`recovery`] - subscription replay after every (re)connection
//! - [`reconnect`] - backoff policy
//! - [`events`] - application callbacks
//! - [`client`] - the session itself and the handle other tasks use

pub mod client;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod recovery;

pub use client::{
    PendingAck, RepublishCounter, Session, SessionHandle, SessionStats, DEFAULT_MAX_PACKET_SIZE,
};
pub use connectivity::{ConnectivityMonitor, ConnectivityState, LinkState, OutageCounter};
pub use error::SessionError;
pub use events::{HandlerRegistry, SessionEvent, SessionHandler, DEFAULT_HANDLER_DEADLINE};
pub use reconnect::{ReconnectConfig, ReconnectionDecision};
pub use recovery::{RecoveryCoordinator, RecoveryReport};
