//! Domain event system: decoupled observation of pipeline outcomes.
//!
//! The orchestrator publishes one event per handled request. Subscribers
//! (logging, the CLI, tests) react without being wired into the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A query was answered and its exchange committed
    QueryCompleted {
        session_id: String,
        invocation_id: String,
        streamed: bool,
        fragments_used: usize,
        retrieval_degraded: bool,
        tokens_used: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A query failed at some stage; nothing was committed
    QueryFailed {
        session_id: String,
        stage: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// The caller went away before the answer was committed
    QueryCancelled {
        session_id: String,
        stage: String,
        timestamp: DateTime<Utc>,
    },

    /// Retrieval was unavailable and the query proceeded without fragments
    RetrievalDegraded {
        session_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A session's history was truncated after a commit
    SessionTruncated {
        session_id: String,
        dropped: usize,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
