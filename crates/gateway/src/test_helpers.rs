//! Router test fixtures.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use http_body_util::BodyExt;
use mentorlink_core::error::ProviderError;
use mentorlink_core::provider::{ModelRequest, Provider, ProviderResponse, Usage};
use mentorlink_core::{Retriever, SessionStore};
use mentorlink_pipeline::{ModelInvoker, Orchestrator, PipelineSettings, QuizGenerator, RetryPolicy};
use mentorlink_retrieval::NoopRetriever;
use mentorlink_session::InMemorySessionStore;

use crate::{GatewayState, SharedState};

/// Answers every request with the same text, or fails with the same error.
pub struct MockProvider {
    reply: Result<String, ProviderError>,
}

impl MockProvider {
    pub fn new(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
        }
    }

    pub fn failing(error: ProviderError) -> Self {
        Self { reply: Err(error) }
    }
}

#[async_trait::async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "gateway_mock"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ProviderResponse, ProviderError> {
        let content = self.reply.clone()?;
        Ok(ProviderResponse {
            content,
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            }),
            model: request.model,
            metadata: serde_json::Map::new(),
        })
    }
}

pub fn test_state(provider: MockProvider) -> SharedState {
    test_state_with(provider, Arc::new(NoopRetriever), PipelineSettings::default())
}

pub fn test_state_with(
    provider: MockProvider,
    retriever: Arc<dyn Retriever>,
    settings: PipelineSettings,
) -> SharedState {
    build_state(provider, Arc::new(InMemorySessionStore::new()), retriever, settings)
}

pub fn test_state_with_store(provider: MockProvider, store: Arc<dyn SessionStore>) -> SharedState {
    build_state(provider, store, Arc::new(NoopRetriever), PipelineSettings::default())
}

fn build_state(
    provider: MockProvider,
    store: Arc<dyn SessionStore>,
    retriever: Arc<dyn Retriever>,
    settings: PipelineSettings,
) -> SharedState {
    let invoker =
        ModelInvoker::new(Arc::new(provider)).with_policy(RetryPolicy::no_retry(Duration::from_secs(5)));
    let quiz = QuizGenerator::new(invoker.clone(), &settings.model, settings.budget_tokens);
    let orchestrator = Orchestrator::new(store, retriever, invoker, settings);
    Arc::new(GatewayState::new(orchestrator, quiz))
}

pub fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
