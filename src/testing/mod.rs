//! Testing utilities and mock implementations
//!
//! This module provides an in-process broker and recording collaborators for
//! exercising the session and its tasks without a real MQTT broker.

pub mod mocks;

pub use mocks::*;
