//! Observability
//!
//! Structured logging only; session statistics are exposed through
//! [`crate::session::SessionStats`] and logged at shutdown.

pub mod logging;

pub use logging::{init_default_logging, init_logging, init_logging_with_level, LogFormat};

// Span macros for structured logging
pub use logging::{session_span, task_span};
