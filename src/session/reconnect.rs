//! Reconnection policy
//!
//! Connect attempts back off along a fixed pattern and then hold at a sustained
//! delay. The attempt cap only applies to the startup connect: once the session
//! has been up, it retries forever and reports progress through connectivity
//! notifications instead of errors.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts allowed for the startup connect (None = unlimited)
    pub initial_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_ms: Vec<u64>,
    /// Delay used once the pattern is exhausted
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_attempts: Some(10),
            backoff_ms: vec![500, 1000, 2000, 5000],
            sustained_delay_ms: 5000,
        }
    }
}

/// Decision result for a reconnection attempt
#[derive(Debug, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Sleep for `delay` then make attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - startup attempts exhausted
    AbortMaxAttemptsExceeded,
}

impl ReconnectConfig {
    /// Backoff delay before the given (1-based) retry
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let millis = self
            .backoff_ms
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms);
        Duration::from_millis(millis)
    }

    /// Decide what to do after `failed_attempts` consecutive failures
    pub fn next_attempt(
        &self,
        failed_attempts: u32,
        startup: bool,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if startup {
            if let Some(max_attempts) = self.initial_attempts {
                if failed_attempts >= max_attempts {
                    return ReconnectionDecision::AbortMaxAttemptsExceeded;
                }
            }
        }

        ReconnectionDecision::Proceed {
            attempt: failed_attempts + 1,
            delay: self.backoff_delay(failed_attempts),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.initial_attempts == Some(0) {
            return Err("initial_attempts must be greater than 0 or omitted for unlimited".to_string());
        }
        if self.sustained_delay_ms == 0 {
            return Err("sustained_delay_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_attempts, Some(10));
        assert_eq!(config.backoff_ms, vec![500, 1000, 2000, 5000]);
        assert_eq!(config.sustained_delay_ms, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_delay() {
        let config = ReconnectConfig {
            initial_attempts: None,
            backoff_ms: vec![25, 50, 100, 250],
            sustained_delay_ms: 300,
        };

        assert_eq!(config.backoff_delay(0), Duration::from_millis(25));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(25));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(50));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(250));
        assert_eq!(config.backoff_delay(5), Duration::from_millis(300));
        assert_eq!(config.backoff_delay(100), Duration::from_millis(300));
    }

    #[test]
    fn test_next_attempt() {
        let config = ReconnectConfig {
            initial_attempts: Some(3),
            backoff_ms: vec![25, 50],
            sustained_delay_ms: 100,
        };

        assert_eq!(
            config.next_attempt(0, true, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay: Duration::from_millis(25)
            }
        );
        assert_eq!(
            config.next_attempt(2, true, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay: Duration::from_millis(50)
            }
        );
        assert_eq!(
            config.next_attempt(3, true, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );

        // The cap does not apply after startup
        assert!(matches!(
            config.next_attempt(50, false, false),
            ReconnectionDecision::Proceed { attempt: 51, .. }
        ));

        assert_eq!(
            config.next_attempt(0, false, true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_validate() {
        let invalid = ReconnectConfig {
            initial_attempts: Some(0),
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        let invalid = ReconnectConfig {
            sustained_delay_ms: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());

        let unlimited = ReconnectConfig {
            initial_attempts: None,
            backoff_ms: vec![],
            sustained_delay_ms: 1000,
        };
        assert!(unlimited.validate().is_ok());
    }
}
