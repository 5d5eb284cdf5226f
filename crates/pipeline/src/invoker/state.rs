//! Invocation lifecycle.
//!
//! ```text
//! Pending ──▶ Sending ──▶ Streaming ──▶ Completed
//!    │          │  ▲          │
//!    │          └──┘ retry    ├──────▶ Failed
//!    │          │             │
//!    │          ├──▶ Completed└──────▶ Cancelled
//!    │          ├──▶ Failed
//!    └──────────┴──▶ Cancelled
//! ```
//!
//! Terminal states absorb: nothing leaves `Completed`, `Failed` or
//! `Cancelled`. Once any chunk has been delivered the invocation is
//! *committed* and may not be retried.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationState {
    Pending,
    Sending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl InvocationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: InvocationState) -> bool {
        use InvocationState::*;
        matches!(
            (self, next),
            (Pending, Sending)
                | (Pending, Cancelled)
                | (Sending, Sending)
                | (Sending, Streaming)
                | (Sending, Completed)
                | (Sending, Failed)
                | (Sending, Cancelled)
                | (Streaming, Completed)
                | (Streaming, Failed)
                | (Streaming, Cancelled)
        )
    }
}

impl std::fmt::Display for InvocationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Invalid invocation transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: InvocationState,
    pub to: InvocationState,
}

impl From<InvalidTransition> for mentorlink_core::Error {
    fn from(e: InvalidTransition) -> Self {
        mentorlink_core::Error::Internal(e.to_string())
    }
}

/// One attempt-spanning model call.
#[derive(Debug, Clone)]
pub struct Invocation {
    id: String,
    state: InvocationState,
    attempts: u32,
    delivered_chunks: usize,
    delivered_chars: usize,
}

impl Invocation {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            state: InvocationState::Pending,
            attempts: 0,
            delivered_chunks: 0,
            delivered_chars: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> InvocationState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn delivered_chunks(&self) -> usize {
        self.delivered_chunks
    }

    pub fn delivered_chars(&self) -> usize {
        self.delivered_chars
    }

    /// At least one chunk reached the caller.
    pub fn is_committed(&self) -> bool {
        self.delivered_chunks > 0
    }

    /// Another attempt is allowed under `max_attempts`.
    pub fn can_retry(&self, max_attempts: u32) -> bool {
        !self.state.is_terminal() && !self.is_committed() && self.attempts < max_attempts
    }

    fn transition(&mut self, next: InvocationState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn begin_attempt(&mut self) -> Result<(), InvalidTransition> {
        if self.is_committed() {
            return Err(InvalidTransition {
                from: self.state,
                to: InvocationState::Sending,
            });
        }
        self.transition(InvocationState::Sending)?;
        self.attempts += 1;
        Ok(())
    }

    /// Record a chunk handed to the caller.
    pub fn record_delivery(&mut self, chars: usize) -> Result<(), InvalidTransition> {
        if self.state != InvocationState::Streaming {
            self.transition(InvocationState::Streaming)?;
        }
        self.delivered_chunks += 1;
        self.delivered_chars += chars;
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition(InvocationState::Completed)
    }

    pub fn fail(&mut self) -> Result<(), InvalidTransition> {
        self.transition(InvocationState::Failed)
    }

    /// Cancellation is idempotent; a terminal invocation stays as it is.
    pub fn cancel(&mut self) {
        if !self.state.is_terminal() {
            self.state = InvocationState::Cancelled;
        }
    }
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}
