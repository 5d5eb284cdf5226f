//! Retriever trait: ranked supporting context for a query.
//!
//! A retriever maps query text to scored fragments. It never touches
//! session state; any caching is the implementation's own business.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use crate::error::RetrievalError;

/// A scored snippet of retrieved text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Unique fragment ID (cited by assistant turns)
    pub id: String,

    /// Where the text came from (document path, URL, ...)
    pub source: String,

    /// The text body
    pub text: String,

    /// Relevance score; higher is better
    pub score: f32,
}

/// A retrieval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalQuery {
    /// The search text
    pub text: String,

    /// Maximum number of results
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum relevance score threshold
    #[serde(default)]
    pub min_score: f32,
}

fn default_top_k() -> usize {
    5
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            top_k: default_top_k(),
            min_score: 0.0,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }
}

/// Enforce the retrieval postconditions on a candidate set: scores at or
/// above `min_score`, descending by score, at most `top_k` entries.
pub fn rank_fragments(mut fragments: Vec<Fragment>, query: &RetrievalQuery) -> Vec<Fragment> {
    fragments.retain(|f| f.score.is_finite() && f.score >= query.min_score);
    fragments.sort_by(|a, b| b.score.total_cmp(&a.score));
    fragments.truncate(query.top_k);
    fragments
}

/// The core Retriever trait.
///
/// Implementations: in-memory keyword index, remote HTTP index, no-op.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// The backend name (e.g., "keyword", "remote", "none").
    fn name(&self) -> &str;

    /// Return fragments for the query, ranked by descending score.
    async fn retrieve(&self, query: &RetrievalQuery) -> std::result::Result<Vec<Fragment>, RetrievalError>;
}
