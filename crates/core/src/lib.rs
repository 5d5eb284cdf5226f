//! # MentorLink Core
//!
//! Domain types, traits, and error definitions for the MentorLink query
//! pipeline. This crate has **no framework dependencies**: it defines the
//! model that the session, retrieval, provider and pipeline crates implement
//! against.
//!
//! ## Layout
//!
//! - [`message`]: sessions, turns and the conversation snapshot
//! - [`provider`]: the model backend contract
//! - [`retrieval`]: fragments and the retriever contract
//! - [`session`]: the keyed session store contract and its lock table
//! - [`event`]: broadcast of pipeline outcomes

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod session;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, RetrievalError, StoreError};
pub use event::{DomainEvent, EventBus};
pub use message::{Conversation, Role, SessionId, Turn};
pub use provider::{ChunkReceiver, ModelRequest, PromptMessage, Provider, ProviderResponse, StreamChunk, Usage};
pub use retrieval::{Fragment, RetrievalQuery, Retriever, rank_fragments};
pub use session::{Exchange, SessionLease, SessionLocks, SessionStore, SessionSummary, TruncateLimit};
