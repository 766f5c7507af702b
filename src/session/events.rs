//! Session events and the handler registry
//!
//! The session reports everything the application may react to as one of a
//! small, closed set of [`SessionEvent`] variants. Handlers are registered up
//! front and invoked in registration order on the session driver task, so a
//! handler that suspends delays the driver. Each invocation is bounded by the
//! registry deadline.

use super::connectivity::LinkState;
use crate::transport::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Default bound on a single handler invocation
pub const DEFAULT_HANDLER_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Message received on a subscribed topic
    Message(InboundMessage),
    /// The link went up (after recovery) or down
    Connectivity(LinkState),
    /// Recovery finished and the session is ready for application traffic
    SessionEstablished { session_present: bool },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Message(_) => "message",
            SessionEvent::Connectivity(_) => "connectivity",
            SessionEvent::SessionEstablished { .. } => "session_established",
        }
    }
}

/// Application callback for session events
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle(&self, event: &SessionEvent);
}

/// Ordered set of handlers supplied when the session is built
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn SessionHandler>>,
    deadline: Duration,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_HANDLER_DEADLINE)
    }
}

impl HandlerRegistry {
    pub fn new(deadline: Duration) -> Self {
        Self {
            handlers: Vec::new(),
            deadline,
        }
    }

    pub fn register<H>(mut self, handler: H) -> Self
    where
        H: SessionHandler + 'static,
    {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn register_shared(mut self, handler: Arc<dyn SessionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver an event to every handler in registration order.
    ///
    /// A handler that exceeds the deadline is abandoned and the next one runs.
    pub async fn dispatch(&self, event: &SessionEvent) {
        for (index, handler) in self.handlers.iter().enumerate() {
            if tokio::time::timeout(self.deadline, handler.handle(event))
                .await
                .is_err()
            {
                error!(
                    handler = index,
                    event = event.kind(),
                    deadline_ms = self.deadline.as_millis() as u64,
                    "Session handler did not return within its deadline; abandoned"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl SessionHandler for Recorder {
        async fn handle(&self, event: &SessionEvent) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.kind()));
        }
    }

    struct Stuck;

    #[async_trait::async_trait]
    impl SessionHandler for Stuck {
        async fn handle(&self, _event: &SessionEvent) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_dispatch_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::default()
            .register(Recorder {
                name: "first",
                log: log.clone(),
            })
            .register(Recorder {
                name: "second",
                log: log.clone(),
            });
        assert_eq!(registry.len(), 2);

        registry
            .dispatch(&SessionEvent::Connectivity(LinkState::Up))
            .await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["first:connectivity", "second:connectivity"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_handler_is_abandoned_after_deadline() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = HandlerRegistry::new(Duration::from_secs(2))
            .register(Stuck)
            .register(Recorder {
                name: "after",
                log: log.clone(),
            });

        let started = tokio::time::Instant::now();
        registry
            .dispatch(&SessionEvent::SessionEstablished {
                session_present: true,
            })
            .await;

        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(*log.lock().unwrap(), vec!["after:session_established"]);
    }

    #[test]
    fn test_empty_registry() {
        let registry = HandlerRegistry::default();
        assert!(registry.is_empty());
    }
}
