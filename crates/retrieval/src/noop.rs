//! No-op retriever: answers every query with no context.

use async_trait::async_trait;
use mentorlink_core::error::RetrievalError;
use mentorlink_core::retrieval::{Fragment, RetrievalQuery, Retriever};

pub struct NoopRetriever;

#[async_trait]
impl Retriever for NoopRetriever {
    fn name(&self) -> &str {
        "none"
    }

    async fn retrieve(&self, _query: &RetrievalQuery) -> Result<Vec<Fragment>, RetrievalError> {
        Ok(Vec::new())
    }
}
