//! Context retriever implementations for MentorLink.
//!
//! All retrievers implement `mentorlink_core::Retriever`. The index behind a
//! retriever is external to the pipeline: a local keyword index over a
//! document folder, a remote search service, or nothing at all.

pub mod keyword;
pub mod noop;
pub mod remote;

pub use keyword::KeywordIndex;
pub use noop::NoopRetriever;
pub use remote::RemoteIndex;

use std::sync::Arc;

use mentorlink_config::RetrievalConfig;
use mentorlink_core::Retriever;

/// Build the configured retriever.
///
/// A keyword index whose document folder cannot be read starts empty; the
/// failure is logged rather than aborting startup.
pub async fn build_from_config(config: &RetrievalConfig) -> Arc<dyn Retriever> {
    match config.backend.as_str() {
        "remote" => match &config.url {
            Some(url) => Arc::new(RemoteIndex::new(url)),
            None => {
                tracing::warn!("retrieval.backend = \"remote\" without a url, retrieval disabled");
                Arc::new(NoopRetriever)
            }
        },
        "keyword" => {
            let index = KeywordIndex::new();
            if let Some(dir) = &config.documents_dir {
                match index.load_dir(dir).await {
                    Ok(count) => tracing::info!(dir = %dir, documents = count, "Keyword index loaded"),
                    Err(e) => tracing::warn!(dir = %dir, error = %e, "Could not load documents, keyword index is empty"),
                }
            }
            Arc::new(index)
        }
        _ => Arc::new(NoopRetriever),
    }
}
