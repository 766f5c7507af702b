//! Connectivity state machine and outage accounting
//!
//! The [`ConnectivityMonitor`] is the only writer of [`ConnectivityState`] and of
//! the outage counter. It is owned by the session driver; everybody else reads
//! through a `watch` receiver or an [`OutageCounter`] clone.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Connection state of the broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    /// No usable link; initial state
    Down,
    /// Link handshake or session recovery in progress
    Connecting,
    /// Link open and subscriptions re-established
    Up,
}

/// User-visible link state carried by connectivity notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Up => f.write_str("up"),
            LinkState::Down => f.write_str("down"),
        }
    }
}

/// Read-only view of the number of outages observed since start
#[derive(Debug, Clone, Default)]
pub struct OutageCounter(Arc<AtomicU64>);

impl OutageCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Tracks connectivity transitions and decides which ones are user-visible.
pub struct ConnectivityMonitor {
    state_tx: watch::Sender<ConnectivityState>,
    reported: LinkState,
    ever_up: bool,
    outages: OutageCounter,
    reconnects: Arc<AtomicU64>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectivityState::Down);
        Self {
            state_tx,
            reported: LinkState::Down,
            ever_up: false,
            outages: OutageCounter::default(),
            reconnects: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record a state change.
    ///
    /// Returns the link notification to dispatch, if any. Repeated observations
    /// of the current state, and moves through `Connecting` that do not change
    /// the reported link state, produce nothing.
    pub fn observe(&mut self, to: ConnectivityState) -> Option<LinkState> {
        let from = *self.state_tx.borrow();
        if from == to {
            return None;
        }

        // Connecting only ever follows Down; a direct Up -> Connecting is an
        // unreported loss of the link.
        if from == ConnectivityState::Up && to == ConnectivityState::Connecting {
            warn!("Link re-entered Connecting without a Down notification");
            let notification = self.observe(ConnectivityState::Down);
            self.observe(to);
            return notification;
        }

        self.state_tx.send_replace(to);
        Self::log_state_transition(from, to);

        match to {
            ConnectivityState::Connecting => None,
            ConnectivityState::Down => {
                if self.reported == LinkState::Up {
                    self.reported = LinkState::Down;
                    let outages = self.outages.0.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(outages, "Outage started");
                    Some(LinkState::Down)
                } else {
                    None
                }
            }
            ConnectivityState::Up => {
                if self.reported == LinkState::Down {
                    if self.ever_up {
                        self.reconnects.fetch_add(1, Ordering::Relaxed);
                    }
                    self.ever_up = true;
                    self.reported = LinkState::Up;
                    Some(LinkState::Up)
                } else {
                    None
                }
            }
        }
    }

    /// Force the state to Down without reporting an outage (orderly shutdown)
    pub fn shut_down(&mut self) {
        let from = self.state_tx.send_replace(ConnectivityState::Down);
        if from != ConnectivityState::Down {
            debug!("Connectivity state {:?} -> Down on shutdown", from);
        }
        self.reported = LinkState::Down;
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Receiver that follows every state change
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    pub fn outages(&self) -> OutageCounter {
        self.outages.clone()
    }

    /// Number of Down -> Up transitions after the first connection
    pub fn reconnects(&self) -> Arc<AtomicU64> {
        self.reconnects.clone()
    }

    /// Check if connection state allows application traffic
    pub fn can_publish(state: ConnectivityState) -> bool {
        matches!(state, ConnectivityState::Up)
    }

    fn log_state_transition(from: ConnectivityState, to: ConnectivityState) {
        match (from, to) {
            (ConnectivityState::Down, ConnectivityState::Connecting) => {
                debug!("Connecting to broker");
            }
            (ConnectivityState::Connecting, ConnectivityState::Up) => {
                info!("Broker session established");
            }
            (ConnectivityState::Up, ConnectivityState::Down) => {
                warn!("Broker link lost");
            }
            (ConnectivityState::Connecting, ConnectivityState::Down) => {
                debug!("Connection attempt failed");
            }
            _ => {
                debug!("Connectivity state: {:?} -> {:?}", from, to);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn connect(monitor: &mut ConnectivityMonitor) -> Option<LinkState> {
        monitor.observe(ConnectivityState::Connecting);
        monitor.observe(ConnectivityState::Up)
    }

    #[test]
    fn test_initial_state() {
        let monitor = ConnectivityMonitor::new();
        assert_eq!(monitor.state(), ConnectivityState::Down);
        assert_eq!(monitor.outages().get(), 0);
    }

    #[test]
    fn test_first_connection_is_not_an_outage() {
        let mut monitor = ConnectivityMonitor::new();
        assert_eq!(connect(&mut monitor), Some(LinkState::Up));
        assert_eq!(monitor.outages().get(), 0);
        assert_eq!(monitor.reconnects().load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_outage_counted_once_per_loss() {
        let mut monitor = ConnectivityMonitor::new();
        connect(&mut monitor);

        assert_eq!(
            monitor.observe(ConnectivityState::Down),
            Some(LinkState::Down)
        );
        // Repeated Down is ignored
        assert_eq!(monitor.observe(ConnectivityState::Down), None);
        // Failed reconnect attempts do not re-notify
        assert_eq!(monitor.observe(ConnectivityState::Connecting), None);
        assert_eq!(monitor.observe(ConnectivityState::Down), None);
        assert_eq!(monitor.outages().get(), 1);

        assert_eq!(connect(&mut monitor), Some(LinkState::Up));
        assert_eq!(monitor.reconnects().load(Ordering::Relaxed), 1);
        assert_eq!(monitor.outages().get(), 1);
    }

    #[test]
    fn test_failed_startup_attempts_are_silent() {
        let mut monitor = ConnectivityMonitor::new();
        for _ in 0..3 {
            assert_eq!(monitor.observe(ConnectivityState::Connecting), None);
            assert_eq!(monitor.observe(ConnectivityState::Down), None);
        }
        assert_eq!(monitor.outages().get(), 0);
    }

    #[test]
    fn test_up_to_connecting_reports_down() {
        let mut monitor = ConnectivityMonitor::new();
        connect(&mut monitor);

        assert_eq!(
            monitor.observe(ConnectivityState::Connecting),
            Some(LinkState::Down)
        );
        assert_eq!(monitor.state(), ConnectivityState::Connecting);
        assert_eq!(monitor.outages().get(), 1);
    }

    #[test]
    fn test_shutdown_is_not_an_outage() {
        let mut monitor = ConnectivityMonitor::new();
        connect(&mut monitor);
        monitor.shut_down();

        assert_eq!(monitor.state(), ConnectivityState::Down);
        assert_eq!(monitor.outages().get(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_transitions() {
        let mut monitor = ConnectivityMonitor::new();
        let mut rx = monitor.subscribe();

        connect(&mut monitor);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), ConnectivityState::Up);
    }

    #[test]
    fn test_can_publish() {
        assert!(ConnectivityMonitor::can_publish(ConnectivityState::Up));
        assert!(!ConnectivityMonitor::can_publish(
            ConnectivityState::Connecting
        ));
        assert!(!ConnectivityMonitor::can_publish(ConnectivityState::Down));
    }

    fn state_strategy() -> impl Strategy<Value = ConnectivityState> {
        prop_oneof![
            Just(ConnectivityState::Down),
            Just(ConnectivityState::Connecting),
            Just(ConnectivityState::Up),
        ]
    }

    proptest! {
        #[test]
        fn prop_outages_match_link_losses(states in proptest::collection::vec(state_strategy(), 0..64)) {
            let mut monitor = ConnectivityMonitor::new();
            let mut notifications = Vec::new();
            for state in &states {
                if let Some(link) = monitor.observe(*state) {
                    notifications.push(link);
                }
            }

            // Notifications strictly alternate, starting with Up
            for (index, link) in notifications.iter().enumerate() {
                let expected = if index % 2 == 0 { LinkState::Up } else { LinkState::Down };
                prop_assert_eq!(*link, expected);
            }

            let downs = notifications.iter().filter(|l| **l == LinkState::Down).count() as u64;
            let ups = notifications.iter().filter(|l| **l == LinkState::Up).count() as u64;
            prop_assert_eq!(monitor.outages().get(), downs);
            prop_assert_eq!(monitor.reconnects().load(Ordering::Relaxed), ups.saturating_sub(1));

            // Once the link is back up, every outage has been followed by a reconnection
            if monitor.state() == ConnectivityState::Up {
                prop_assert_eq!(monitor.outages().get(), monitor.reconnects().load(Ordering::Relaxed));
            }
        }
    }
}
