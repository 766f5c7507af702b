//! Liveness heartbeat
//!
//! Toggles an indicator at a fixed period. It never touches the session, so it
//! keeps beating while the publisher is blocked on an outage.

use crate::indicator::Indicator;
use crate::task_span;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace, Instrument};

pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(500);

pub struct Heartbeat {
    period: Duration,
    indicator: Arc<dyn Indicator>,
    beats: u64,
}

impl Heartbeat {
    pub fn new(period: Duration, indicator: Arc<dyn Indicator>) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            indicator,
            beats: 0,
        }
    }

    /// Toggle the indicator once
    pub fn beat(&mut self) {
        self.indicator.toggle();
        self.beats += 1;
        trace!(beats = self.beats, on = self.indicator.is_on(), "Heartbeat");
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    /// Beat forever
    pub async fn run(mut self) {
        info!(
            period_ms = self.period.as_millis() as u64,
            "Heartbeat started"
        );
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // First tick completes immediately, skip it

        loop {
            interval.tick().await;
            self.beat();
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let span = task_span!(task = "heartbeat");
        tokio::spawn(self.run().instrument(span))
    }
}
