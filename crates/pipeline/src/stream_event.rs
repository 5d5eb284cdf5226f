//! Query-level streaming events.
//!
//! `QueryEvent` is what the gateway forwards to clients over SSE:
//! - `start`: session, invocation and citations, before any text
//! - `chunk`: partial answer text
//! - `done`: the exchange was committed
//! - `error`: the stream ended early; text already sent stands

use mentorlink_core::provider::Usage;
use mentorlink_core::retrieval::Fragment;
use serde::{Deserialize, Serialize};

use crate::orchestrator::Stage;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum QueryEvent {
    Start {
        session_id: String,
        invocation_id: String,
        citations: Vec<Fragment>,
        retrieval_degraded: bool,
    },

    Chunk { content: String },

    Done {
        session_id: String,
        invocation_id: String,
        usage: Option<Usage>,
        chunks: usize,
    },

    Error {
        stage: Stage,
        message: String,
        delivered_chunks: usize,
    },
}

impl QueryEvent {
    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serialization() {
        let event = QueryEvent::Chunk { content: "Hello".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn start_uses_camel_case_fields() {
        let event = QueryEvent::Start {
            session_id: "s1".into(),
            invocation_id: "i1".into(),
            citations: vec![],
            retrieval_degraded: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"start""#));
        assert!(json.contains(r#""sessionId":"s1""#));
        assert!(json.contains(r#""retrievalDegraded":true"#));
    }

    #[test]
    fn error_carries_stage() {
        let event = QueryEvent::Error {
            stage: Stage::Invocation,
            message: "boom".into(),
            delivered_chunks: 2,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""stage":"invocation""#));
        assert!(json.contains(r#""deliveredChunks":2"#));
        assert!(event.is_terminal());
    }

    #[test]
    fn event_type_names() {
        assert_eq!(QueryEvent::Chunk { content: "x".into() }.event_type(), "chunk");
        assert_eq!(
            QueryEvent::Done {
                session_id: "s".into(),
                invocation_id: "i".into(),
                usage: None,
                chunks: 0
            }
            .event_type(),
            "done"
        );
        assert!(!QueryEvent::Chunk { content: "x".into() }.is_terminal());
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"type":"chunk","content":"hi"}"#;
        let event: QueryEvent = serde_json::from_str(json).unwrap();
        match event {
            QueryEvent::Chunk { content } => assert_eq!(content, "hi"),
            _ => panic!("Wrong variant"),
        }
    }
}
