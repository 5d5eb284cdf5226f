//! In-memory session store: the default for a single gateway process.

use async_trait::async_trait;
use mentorlink_core::error::StoreError;
use mentorlink_core::message::{Conversation, SessionId, Turn};
use mentorlink_core::session::{Exchange, SessionLocks, SessionStore, SessionSummary, TruncateLimit};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Default upper bound on retained sessions.
const DEFAULT_MAX_SESSIONS: usize = 1000;

/// Stores conversations in a map keyed by session id.
///
/// When `max_sessions` is reached, creating a new session evicts the one
/// that was updated least recently.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<String, Conversation>>>,
    locks: SessionLocks,
    max_sessions: usize,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SESSIONS)
    }

    pub fn with_capacity(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            locks: SessionLocks::new(),
            max_sessions: max_sessions.max(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Get or create the conversation under an already-held write lock.
    fn entry<'a>(&self, sessions: &'a mut HashMap<String, Conversation>, id: &SessionId) -> &'a mut Conversation {
        if !sessions.contains_key(&id.0) && sessions.len() >= self.max_sessions {
            let oldest = sessions
                .values()
                .min_by_key(|c| c.updated_at)
                .map(|c| c.id.0.clone());
            if let Some(oldest) = oldest {
                debug!(evicted = %oldest, "Session store full, evicting least recently updated session");
                sessions.remove(&oldest);
            }
        }
        sessions
            .entry(id.0.clone())
            .or_insert_with(|| Conversation::new(id.clone()))
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, id: &SessionId) -> Result<Conversation, StoreError> {
        if let Some(conv) = self.sessions.read().await.get(&id.0) {
            return Ok(conv.clone());
        }
        let mut sessions = self.sessions.write().await;
        Ok(self.entry(&mut sessions, id).clone())
    }

    async fn find(&self, id: &SessionId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.sessions.read().await.get(&id.0).cloned())
    }

    async fn append(&self, id: &SessionId, turn: Turn) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        self.entry(&mut sessions, id).push(turn);
        Ok(())
    }

    async fn commit_exchange(&self, id: &SessionId, exchange: Exchange) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let conv = self.entry(&mut sessions, id);
        if conv.has_invocation(&exchange.invocation_id) {
            debug!(session_id = %id, invocation_id = %exchange.invocation_id, "Exchange already committed");
            return Ok(false);
        }
        for turn in exchange.into_turns() {
            conv.push(turn);
        }
        Ok(true)
    }

    async fn truncate(&self, id: &SessionId, limit: TruncateLimit) -> Result<usize, StoreError> {
        let mut sessions = self.sessions.write().await;
        Ok(limit.apply(self.entry(&mut sessions, id)))
    }

    async fn list(&self) -> Result<Vec<SessionSummary>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .map(|c| SessionSummary {
                id: c.id.clone(),
                turn_count: c.turns.len(),
                created_at: c.created_at,
                updated_at: c.updated_at,
            })
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn delete(&self, id: &SessionId) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(&id.0).is_some())
    }

    fn locks(&self) -> &SessionLocks {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentorlink_core::message::Role;

    #[tokio::test]
    async fn get_creates_empty_conversation() {
        let store = InMemorySessionStore::new();
        let conv = store.get(&SessionId::from("fresh")).await.unwrap();
        assert_eq!(conv.id.as_str(), "fresh");
        assert!(conv.turns.is_empty());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn find_does_not_create_or_evict() {
        let store = InMemorySessionStore::with_capacity(1);
        let real = SessionId::from("real");
        store.append(&real, Turn::user("keep me")).await.unwrap();

        assert!(store.find(&SessionId::from("ghost")).await.unwrap().is_none());
        assert_eq!(store.len().await, 1);

        let conv = store.find(&real).await.unwrap().unwrap();
        assert_eq!(conv.turns[0].content, "keep me");
    }

    #[tokio::test]
    async fn snapshot_is_detached() {
        let store = InMemorySessionStore::new();
        let id = SessionId::from("s");
        let mut snapshot = store.get(&id).await.unwrap();
        snapshot.push(Turn::user("not stored"));
        assert!(store.get(&id).await.unwrap().turns.is_empty());
    }

    #[tokio::test]
    async fn commit_exchange_appends_pair_in_order() {
        let store = InMemorySessionStore::new();
        let id = SessionId::from("s");
        let committed = store
            .commit_exchange(&id, Exchange::new("inv-1", Turn::user("q"), Turn::assistant("a")))
            .await
            .unwrap();
        assert!(committed);

        let conv = store.get(&id).await.unwrap();
        assert_eq!(conv.turns.len(), 2);
        assert_eq!(conv.turns[0].role, Role::User);
        assert_eq!(conv.turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn commit_exchange_is_idempotent_per_invocation() {
        let store = InMemorySessionStore::new();
        let id = SessionId::from("s");
        let ex = Exchange::new("inv-1", Turn::user("q"), Turn::assistant("a"));
        assert!(store.commit_exchange(&id, ex.clone()).await.unwrap());
        assert!(!store.commit_exchange(&id, ex).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap().turns.len(), 2);
    }

    #[tokio::test]
    async fn truncate_reports_dropped() {
        let store = InMemorySessionStore::new();
        let id = SessionId::from("s");
        for i in 0..6 {
            store.append(&id, Turn::user(format!("turn {i}"))).await.unwrap();
        }
        assert_eq!(store.truncate(&id, TruncateLimit::MaxTurns(4)).await.unwrap(), 2);
        let conv = store.get(&id).await.unwrap();
        assert_eq!(conv.turns.first().unwrap().content, "turn 2");
    }

    #[tokio::test]
    async fn full_store_evicts_least_recently_updated() {
        let store = InMemorySessionStore::with_capacity(2);
        store.append(&SessionId::from("a"), Turn::user("1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.append(&SessionId::from("b"), Turn::user("2")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        store.append(&SessionId::from("a"), Turn::user("3")).await.unwrap();
        store.get(&SessionId::from("c")).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|s| s.id.0).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()));
        assert!(!ids.contains(&"b".to_string()));
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let store = InMemorySessionStore::new();
        let id = SessionId::from("s");
        store.append(&id, Turn::user("x")).await.unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn leased_commits_never_interleave() {
        let store = Arc::new(InMemorySessionStore::new());
        let id = SessionId::from("shared");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                let _lease = store.lock(&id).await;
                let before = store.get(&id).await.unwrap().turns.len();
                tokio::task::yield_now().await;
                store
                    .commit_exchange(
                        &id,
                        Exchange::new(format!("inv-{i}"), Turn::user(format!("q{i}")), Turn::assistant(format!("a{i}"))),
                    )
                    .await
                    .unwrap();
                assert_eq!(store.get(&id).await.unwrap().turns.len(), before + 2);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let conv = store.get(&id).await.unwrap();
        assert_eq!(conv.turns.len(), 32);
        for pair in conv.turns.chunks(2) {
            assert_eq!(pair[0].role, Role::User);
            assert_eq!(pair[1].role, Role::Assistant);
            assert_eq!(pair[0].invocation_id, pair[1].invocation_id);
        }
    }
}
