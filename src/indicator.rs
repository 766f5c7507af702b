//! Status indicators
//!
//! Physical outputs (LEDs and the like) are external collaborators; the crate
//! only needs something that can be switched on and off. [`TracingIndicator`]
//! stands in for hardware by logging level changes.

use crate::session::{LinkState, SessionEvent, SessionHandler};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A binary status output
pub trait Indicator: Send + Sync {
    fn set(&self, on: bool);

    fn is_on(&self) -> bool;

    fn toggle(&self) {
        self.set(!self.is_on());
    }
}

/// Indicator that reports its level through `tracing`
#[derive(Debug)]
pub struct TracingIndicator {
    name: String,
    on: AtomicBool,
}

impl TracingIndicator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on: AtomicBool::new(false),
        }
    }
}

impl Indicator for TracingIndicator {
    fn set(&self, on: bool) {
        if self.on.swap(on, Ordering::Relaxed) != on {
            debug!(target: "indicator", indicator = %self.name, on, "Indicator changed");
        }
    }

    fn is_on(&self) -> bool {
        self.on.load(Ordering::Relaxed)
    }
}

/// Connectivity handler: lights the indicator while the link is up and
/// pauses briefly on every transition to let the link settle.
pub struct LinkIndicator {
    indicator: Arc<dyn Indicator>,
    settle: Duration,
}

impl LinkIndicator {
    pub fn new(indicator: Arc<dyn Indicator>, settle: Duration) -> Self {
        Self { indicator, settle }
    }
}

#[async_trait::async_trait]
impl SessionHandler for LinkIndicator {
    async fn handle(&self, event: &SessionEvent) {
        let SessionEvent::Connectivity(state) = event else {
            return;
        };

        self.indicator.set(*state == LinkState::Up);
        match state {
            LinkState::Up => info!("Link is up"),
            LinkState::Down => warn!("Link is down"),
        }
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mocks::RecordingIndicator;

    #[test]
    fn test_toggle() {
        let indicator = TracingIndicator::new("heartbeat");
        assert!(!indicator.is_on());
        indicator.toggle();
        assert!(indicator.is_on());
        indicator.toggle();
        assert!(!indicator.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_indicator_follows_connectivity() {
        let indicator = RecordingIndicator::new();
        let handler = LinkIndicator::new(Arc::new(indicator.clone()), Duration::from_secs(1));

        let started = tokio::time::Instant::now();
        handler
            .handle(&SessionEvent::Connectivity(LinkState::Up))
            .await;
        assert!(indicator.is_on());
        assert!(started.elapsed() >= Duration::from_secs(1));

        handler
            .handle(&SessionEvent::Connectivity(LinkState::Down))
            .await;
        assert!(!indicator.is_on());
        assert_eq!(indicator.changes(), 2);
    }

    #[tokio::test]
    async fn test_link_indicator_ignores_other_events() {
        let indicator = RecordingIndicator::new();
        let handler = LinkIndicator::new(Arc::new(indicator.clone()), Duration::ZERO);

        handler
            .handle(&SessionEvent::SessionEstablished {
                session_present: false,
            })
            .await;
        assert_eq!(indicator.changes(), 0);
    }
}
