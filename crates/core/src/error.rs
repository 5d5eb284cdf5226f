//! Error types for the MentorLink domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context (provider, retrieval, store) has its own error type;
//! the top-level [`Error`] is what pipeline stages return.

use thiserror::Error;

/// The top-level error type for all pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Client errors ---
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Prompt budget exceeded: {required} tokens required, budget is {budget}")]
    BudgetExceeded { required: usize, budget: usize },

    // --- Retrieval ---
    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(#[from] RetrievalError),

    // --- Model backend ---
    #[error("Model transport failed after {attempts} attempt(s): {source}")]
    ModelTransport {
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("Stream failed after delivering {delivered_chunks} chunk(s) ({delivered_chars} chars): {source}")]
    StreamInterrupted {
        delivered_chunks: usize,
        delivered_chars: usize,
        #[source]
        source: ProviderError,
    },

    // --- Lifecycle ---
    #[error("Request cancelled")]
    Cancelled,

    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    // --- Session store ---
    #[error("Session store error: {0}")]
    Store(#[from] StoreError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error is the expected outcome of a caller going away.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Transient failures are worth another attempt; everything else fails fast.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_)
            | ProviderError::Network(_)
            | ProviderError::RateLimited { .. }
            | ProviderError::StreamInterrupted(_) => true,
            ProviderError::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("Index unreachable: {0}")]
    Unreachable(String),

    #[error("Index query timed out after {0}ms")]
    Timeout(u64),

    #[error("Index returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}
