//! Session store trait: keyed conversation history with per-key exclusion.
//!
//! The store is the only shared mutable state in the pipeline. Every mutation
//! goes through `append`, `commit_exchange` or `truncate`, each atomic per
//! session id. Callers that need a read-modify-write sequence across several
//! calls (the orchestrator, for a whole request) hold a [`SessionLease`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;

use crate::error::StoreError;
use crate::message::{Conversation, SessionId, Turn};

/// A completed user/assistant pair, committed both-or-neither.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub invocation_id: String,
    pub user: Turn,
    pub assistant: Turn,
}

impl Exchange {
    /// Build an exchange; both turns are tagged with the invocation id.
    pub fn new(invocation_id: impl Into<String>, user: Turn, assistant: Turn) -> Self {
        let invocation_id = invocation_id.into();
        Self {
            user: user.with_invocation(invocation_id.clone()),
            assistant: assistant.with_invocation(invocation_id.clone()),
            invocation_id,
        }
    }

    pub fn into_turns(self) -> [Turn; 2] {
        [self.user, self.assistant]
    }
}

/// Size bound for [`SessionStore::truncate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncateLimit {
    MaxTurns(usize),
    MaxTokens(usize),
}

impl TruncateLimit {
    /// Apply the bound to a conversation, returning the number of turns dropped.
    pub fn apply(&self, conversation: &mut Conversation) -> usize {
        match *self {
            TruncateLimit::MaxTurns(n) => conversation.truncate_to_turns(n),
            TruncateLimit::MaxTokens(n) => conversation.truncate_to_tokens(n),
        }
    }
}

/// Listing entry for a stored session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub turn_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-session mutual exclusion.
///
/// Entries are created on demand and pruned once nobody holds or waits on
/// them, so the table stays proportional to in-flight sessions.
#[derive(Debug, Default)]
pub struct SessionLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn acquire(&self, id: &SessionId) -> SessionLease {
        let slot = {
            let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            // Only the table references an idle slot.
            table.retain(|_, slot| Arc::strong_count(slot) > 1);
            table
                .entry(id.0.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = slot.lock_owned().await;
        SessionLease {
            session_id: id.clone(),
            _guard: guard,
        }
    }

    /// Number of sessions currently locked or awaited.
    pub fn active(&self) -> usize {
        let table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        table.values().filter(|slot| Arc::strong_count(slot) > 1).count()
    }
}

/// Exclusive access to one session, released on drop.
#[derive(Debug)]
pub struct SessionLease {
    session_id: SessionId,
    _guard: OwnedMutexGuard<()>,
}

impl SessionLease {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

/// The core SessionStore trait.
///
/// Implementations: in-memory, SQLite.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Snapshot of the conversation; an unknown id yields a new empty one.
    async fn get(&self, id: &SessionId) -> std::result::Result<Conversation, StoreError>;

    /// Snapshot of an existing conversation. Never creates one.
    async fn find(&self, id: &SessionId) -> std::result::Result<Option<Conversation>, StoreError>;

    /// Append a single turn.
    async fn append(&self, id: &SessionId, turn: Turn) -> std::result::Result<(), StoreError>;

    /// Append a user/assistant pair atomically.
    ///
    /// Returns `false` without writing if a turn from the same invocation
    /// is already stored.
    async fn commit_exchange(&self, id: &SessionId, exchange: Exchange) -> std::result::Result<bool, StoreError>;

    /// Drop oldest turns until the bound holds. Returns the number dropped.
    async fn truncate(&self, id: &SessionId, limit: TruncateLimit) -> std::result::Result<usize, StoreError>;

    /// All known sessions.
    async fn list(&self) -> std::result::Result<Vec<SessionSummary>, StoreError>;

    /// Remove a session. Returns whether it existed.
    async fn delete(&self, id: &SessionId) -> std::result::Result<bool, StoreError>;

    /// The lock table guarding this store's sessions.
    fn locks(&self) -> &SessionLocks;

    /// Acquire exclusive access to one session.
    async fn lock(&self, id: &SessionId) -> SessionLease {
        self.locks().acquire(id).await
    }
}
