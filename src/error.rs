//! Crate-level error type
//!
//! Each layer has its own error enum; this one gathers them for the binary and
//! maps them to process exit codes.

use crate::config::ConfigError;
use crate::session::SessionError;
use crate::tasks::PublisherError;
use thiserror::Error;

/// Main error type for the telemetry publisher
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Publisher error: {0}")]
    Publisher(#[from] PublisherError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AppError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 2,
            AppError::Session(SessionError::Connection { .. }) => 3,
            AppError::Session(_) | AppError::Publisher(_) => 4,
            AppError::Io(_) => 5,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
