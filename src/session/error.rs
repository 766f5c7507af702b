//! Session error taxonomy
//!
//! Transient transport failures never reach callers: the session driver turns
//! them into Down notifications and reconnects. Only malformed requests, a
//! startup connect that exhausted its retries, and use after close surface here.

use crate::transport::LinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection failed after {attempts} attempts: {reason}")]
    Connection { attempts: u32, reason: String },

    #[error("Fatal protocol error: {0}")]
    FatalProtocol(String),

    #[error("Re-subscription to {topic} failed during recovery")]
    Handshake {
        topic: String,
        #[source]
        source: LinkError,
    },

    #[error("Transient transport error: {0}")]
    Transient(#[from] LinkError),

    #[error("Session already connected")]
    AlreadyConnected,

    #[error("Session closed")]
    Closed,
}

impl SessionError {
    /// Errors the caller is expected to act on (log, skip or terminate)
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::FatalProtocol(_) | SessionError::Closed)
    }
}
