//! Session and Turn domain types.
//!
//! A conversation is the ordered history of completed exchanges for one
//! session: user asks → pipeline answers → both turns are committed together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a conversation (session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a turn's author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The model's answer
    Assistant,
    /// System instructions
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// A single message in a conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Unique turn ID
    pub id: String,

    /// Who authored this turn
    pub role: Role,

    /// The text content
    pub content: String,

    /// Ids of the fragments this turn cites
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<String>,

    /// The model invocation that produced the exchange this turn belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,

    /// Timestamp
    pub created_at: DateTime<Utc>,
}

impl Turn {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            citations: Vec::new(),
            invocation_id: None,
            created_at: Utc::now(),
        }
    }

    /// Create a new user turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant turn.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system turn.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    pub fn with_citations(mut self, citations: Vec<String>) -> Self {
        self.citations = citations;
        self
    }

    pub fn with_invocation(mut self, invocation_id: impl Into<String>) -> Self {
        self.invocation_id = Some(invocation_id.into());
        self
    }
}

/// A conversation snapshot: the ordered turns of one session.
///
/// Values handed out by a session store are copies; mutating one never
/// changes stored state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Session this history belongs to
    pub id: SessionId,

    /// Ordered turns
    pub turns: Vec<Turn>,

    /// When this conversation was created
    pub created_at: DateTime<Utc>,

    /// When the last turn was added or removed
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Create a new empty conversation for the given session.
    pub fn new(id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            id,
            turns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a turn to the conversation.
    pub fn push(&mut self, turn: Turn) {
        self.updated_at = Utc::now();
        self.turns.push(turn);
    }

    /// Whether an exchange from this invocation was already recorded.
    pub fn has_invocation(&self, invocation_id: &str) -> bool {
        self.turns
            .iter()
            .any(|t| t.invocation_id.as_deref() == Some(invocation_id))
    }

    /// Rough token estimate (4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.turns.iter().map(|t| approx_tokens(&t.content)).sum()
    }

    /// Drop oldest turns until at most `max_turns` remain. Returns the number dropped.
    pub fn truncate_to_turns(&mut self, max_turns: usize) -> usize {
        let excess = self.turns.len().saturating_sub(max_turns);
        if excess > 0 {
            self.turns.drain(..excess);
            self.updated_at = Utc::now();
        }
        excess
    }

    /// Drop oldest turns until the estimated size fits `max_tokens`. Returns the number dropped.
    pub fn truncate_to_tokens(&mut self, max_tokens: usize) -> usize {
        let mut total = self.estimated_tokens();
        let mut excess = 0;
        for turn in &self.turns {
            if total <= max_tokens {
                break;
            }
            total -= approx_tokens(&turn.content);
            excess += 1;
        }
        if excess > 0 {
            self.turns.drain(..excess);
            self.updated_at = Utc::now();
        }
        excess
    }
}

/// Characters, not bytes, over four, rounded up.
fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}
