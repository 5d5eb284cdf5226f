//! Remote index client.
//!
//! Sends `POST {base_url}/search` with `{query, top_k, min_score}` and expects
//! `{"results": [{id, source, text, score}, ...]}`. Whatever the service
//! returns is re-ranked locally so the retrieval postconditions always hold.

use std::time::Duration;

use async_trait::async_trait;
use mentorlink_core::error::RetrievalError;
use mentorlink_core::retrieval::{Fragment, RetrievalQuery, Retriever, rank_fragments};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub struct RemoteIndex {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    min_score: f32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(alias = "fragments")]
    results: Vec<Fragment>,
}

impl RemoteIndex {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait]
impl Retriever for RemoteIndex {
    fn name(&self) -> &str {
        "remote"
    }

    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<Fragment>, RetrievalError> {
        let url = format!("{}/search", self.base_url);
        debug!(url = %url, top_k = query.top_k, "Querying remote index");

        let response = self
            .client
            .post(&url)
            .json(&SearchRequest {
                query: &query.text,
                top_k: query.top_k,
                min_score: query.min_score,
            })
            .send()
            .await
            .map_err(|e| RetrievalError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RetrievalError::Unreachable(format!("index returned status {status}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| RetrievalError::InvalidResponse(e.to_string()))?;

        Ok(rank_fragments(body.results, query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};

    async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn results_are_reranked_and_filtered() {
        let router = Router::new().route(
            "/search",
            post(|Json(req): Json<serde_json::Value>| async move {
                assert_eq!(req["query"], "photosynthesis");
                Json(serde_json::json!({
                    "results": [
                        {"id": "a", "source": "bio.md", "text": "low", "score": 0.1},
                        {"id": "b", "source": "bio.md", "text": "high", "score": 0.9},
                        {"id": "c", "source": "bio.md", "text": "mid", "score": 0.5},
                        {"id": "d", "source": "bio.md", "text": "mid-high", "score": 0.7}
                    ]
                }))
            }),
        );
        let index = RemoteIndex::new(spawn(router).await);

        let results = index
            .retrieve(&RetrievalQuery::new("photosynthesis").with_top_k(2).with_min_score(0.2))
            .await
            .unwrap();
        let ids: Vec<&str> = results.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn server_error_is_unreachable() {
        let router = Router::new().route("/search", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let index = RemoteIndex::new(spawn(router).await);
        let err = index.retrieve(&RetrievalQuery::new("x")).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unreachable(_)));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let index = RemoteIndex::new(format!("http://{addr}/"));
        let err = index.retrieve(&RetrievalQuery::new("x")).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Unreachable(_)));
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_response() {
        let router = Router::new().route("/search", post(|| async { "not json" }));
        let index = RemoteIndex::new(spawn(router).await);
        let err = index.retrieve(&RetrievalQuery::new("x")).await.unwrap_err();
        assert!(matches!(err, RetrievalError::InvalidResponse(_)));
    }
}
