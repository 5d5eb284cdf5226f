//! Query, tutoring, quiz and session endpoints.
//!
//! - `POST /query`: answer a question, JSON or SSE
//! - `POST /tutor`: answer for a learner profile
//! - `POST /quiz`: generate a multiple-choice quiz
//! - `GET /quiz-html/{subject}/{level}/{num_questions}`: the quiz as an HTML page
//! - `GET /sessions`: list sessions
//! - `GET /sessions/{id}`: one session's turns
//! - `DELETE /sessions/{id}`: forget a session

use std::convert::Infallible;

use axum::{
    Json,
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{Html, IntoResponse, Response},
};
use mentorlink_core::provider::Usage;
use mentorlink_core::retrieval::Fragment;
use mentorlink_core::{Conversation, Error, SessionId, SessionSummary};
use mentorlink_pipeline::quiz::DEFAULT_QUESTIONS;
use mentorlink_pipeline::{AnswerStream, AssemblyMetadata, Outcome, QueryAnswer, QueryRequest, QuizQuestion, Stage, TutorProfile};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::SharedState;
use crate::error::ApiError;

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryBody {
    pub session_id: Option<String>,
    pub query: Option<String>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResponse {
    pub answer: String,
    pub citations: Vec<Fragment>,
    pub session_id: String,
    pub retrieval_degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub invocation_id: String,
    pub metadata: AssemblyMetadata,
}

impl From<QueryAnswer> for QueryResponse {
    fn from(answer: QueryAnswer) -> Self {
        Self {
            answer: answer.answer,
            citations: answer.citations,
            session_id: answer.session_id.0,
            retrieval_degraded: answer.retrieval_degraded,
            usage: answer.usage,
            invocation_id: answer.invocation_id,
            metadata: answer.metadata,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TutorBody {
    pub subject: String,
    pub level: String,
    pub question: String,
    pub learning_style: Option<String>,
    pub background: Option<String>,
    pub language: Option<String>,
    #[serde(rename = "sessionId", alias = "session_id")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TutorResponse {
    pub response: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub citations: Vec<Fragment>,
}

fn default_num_questions() -> usize {
    DEFAULT_QUESTIONS
}

fn default_reveal_format() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct QuizBody {
    pub subject: String,
    pub level: String,
    #[serde(default = "default_num_questions")]
    pub num_questions: usize,
    #[serde(default = "default_reveal_format")]
    pub reveal_format: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuizResponse {
    pub quiz: Vec<QuizQuestion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub formatted_quiz: Option<String>,
    /// Placeholder questions stand in for unusable model output.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub count: usize,
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /query`
pub async fn query_handler(
    State(state): State<SharedState>,
    payload: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = payload?;
    let query = body.query.ok_or_else(|| ApiError::bad_request("query is required"))?;
    info!(session_id = ?body.session_id, stream = body.stream, "Query request");

    let mut request = QueryRequest::new(query);
    if let Some(id) = body.session_id {
        request = request.with_session(SessionId(id));
    }
    if body.stream {
        request = request.streaming();
    }

    match handle(&state, request).await? {
        Outcome::Answer(answer) => Ok(Json(QueryResponse::from(answer)).into_response()),
        Outcome::Stream(stream) => Ok(sse_response(stream).into_response()),
    }
}

/// `POST /tutor`
pub async fn tutor_handler(
    State(state): State<SharedState>,
    payload: Result<Json<TutorBody>, JsonRejection>,
) -> Result<Json<TutorResponse>, ApiError> {
    let Json(body) = payload?;
    if body.subject.trim().is_empty() || body.level.trim().is_empty() {
        return Err(ApiError::bad_request("subject and level are required"));
    }
    info!(subject = %body.subject, level = %body.level, "Tutor request");

    let mut profile = TutorProfile::new(body.subject, body.level);
    if let Some(style) = body.learning_style {
        profile = profile.with_learning_style(style);
    }
    if let Some(background) = body.background {
        profile = profile.with_background(background);
    }
    if let Some(language) = body.language {
        profile = profile.with_language(language);
    }

    let mut request = QueryRequest::new(body.question).with_profile(profile);
    if let Some(id) = body.session_id {
        request = request.with_session(SessionId(id));
    }

    match handle(&state, request).await? {
        Outcome::Answer(answer) => Ok(Json(TutorResponse {
            response: answer.answer,
            session_id: answer.session_id.0,
            citations: answer.citations,
        })),
        Outcome::Stream(_) => Err(ApiError::from_error(
            Stage::Invocation,
            Error::Internal("unexpected streaming outcome".into()),
        )),
    }
}

/// `POST /quiz`
pub async fn quiz_handler(
    State(state): State<SharedState>,
    payload: Result<Json<QuizBody>, JsonRejection>,
) -> Result<Json<QuizResponse>, ApiError> {
    let Json(body) = payload?;
    info!(subject = %body.subject, level = %body.level, num_questions = body.num_questions, "Quiz request");

    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let quiz = state
        .quiz
        .generate(&body.subject, &body.level, body.num_questions, &cancel)
        .await
        .map_err(quiz_error)?;

    let formatted_quiz = body.reveal_format.then(|| quiz.to_html());
    Ok(Json(QuizResponse {
        quiz: quiz.questions,
        formatted_quiz,
        fallback: quiz.fallback,
    }))
}

/// `GET /quiz-html/{subject}/{level}/{num_questions}`
pub async fn quiz_html_handler(
    State(state): State<SharedState>,
    Path((subject, level, num_questions)): Path<(String, String, usize)>,
) -> Result<Html<String>, ApiError> {
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let quiz = state
        .quiz
        .generate(&subject, &level, num_questions, &cancel)
        .await
        .map_err(quiz_error)?;
    Ok(Html(quiz.to_html()))
}

/// `GET /sessions`
pub async fn list_sessions_handler(State(state): State<SharedState>) -> Result<Json<SessionListResponse>, ApiError> {
    let sessions = state
        .orchestrator
        .store()
        .list()
        .await
        .map_err(|e| ApiError::from_error(Stage::Session, e.into()))?;
    let count = sessions.len();
    Ok(Json(SessionListResponse { sessions, count }))
}

/// `GET /sessions/{id}`
pub async fn get_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    let conversation = state
        .orchestrator
        .store()
        .find(&SessionId(id.clone()))
        .await
        .map_err(|e| ApiError::from_error(Stage::Session, e.into()))?;
    match conversation {
        Some(conversation) if !conversation.turns.is_empty() => Ok(Json(conversation)),
        _ => Err(ApiError::not_found(format!("Session '{id}' not found"))),
    }
}

/// `DELETE /sessions/{id}`
pub async fn delete_session_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = SessionId(id.clone());
    let _lease = state.orchestrator.store().lock(&session_id).await;
    let existed = state
        .orchestrator
        .store()
        .delete(&session_id)
        .await
        .map_err(|e| ApiError::from_error(Stage::Session, e.into()))?;
    if existed {
        info!(session_id = %id, "Session deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Session '{id}' not found")))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Run one query. Dropping the handler future (client gone) cancels it.
async fn handle(state: &SharedState, request: QueryRequest) -> Result<Outcome, ApiError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let outcome = state.orchestrator.handle(request, cancel).await?;
    // The stream cancels itself when the response body is dropped.
    guard.disarm();
    Ok(outcome)
}

fn quiz_error(error: Error) -> ApiError {
    let stage = match &error {
        Error::Validation(_) => Stage::Validation,
        Error::BudgetExceeded { .. } => Stage::Assembly,
        _ => Stage::Invocation,
    };
    ApiError::from_error(stage, error)
}

fn sse_response(stream: AnswerStream) -> Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>> {
    let events = stream.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().event(event.event_type()).data(data))
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::StatusCode;
    use mentorlink_core::error::ProviderError;
    use mentorlink_pipeline::PipelineSettings;
    use mentorlink_retrieval::KeywordIndex;
    use mentorlink_session::InMemorySessionStore;
    use serde_json::json;
    use tower::ServiceExt;

    use crate::build_router;
    use crate::test_helpers::*;

    const QUIZ_JSON: &str = r#"[
        {"question": "What is 2 + 2?", "options": ["3", "4", "5", "6"], "correct_answer": "4", "explanation": "Basic addition."},
        {"question": "What is 3 x 3?", "options": ["6", "8", "9", "12"], "correct_answer": "9"}
    ]"#;

    #[tokio::test]
    async fn query_returns_answer_and_session() {
        let app = build_router(test_state(MockProvider::new("Photosynthesis turns light into sugar.")));

        let response = app
            .oneshot(post_json("/query", json!({"query": "What is photosynthesis?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["answer"], "Photosynthesis turns light into sugar.");
        assert!(!body["sessionId"].as_str().unwrap().is_empty());
        assert_eq!(body["retrievalDegraded"], false);
        assert_eq!(body["usage"]["total_tokens"], 15);
        assert!(body["metadata"]["total_tokens"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn query_commits_both_turns() {
        let state = test_state(MockProvider::new("Forty-two."));

        let response = build_router(state.clone())
            .oneshot(post_json("/query", json!({"sessionId": "s1", "query": "The answer?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(state).oneshot(get("/sessions/s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let turns = body["turns"].as_array().unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0]["role"], "user");
        assert_eq!(turns[1]["content"], "Forty-two.");
    }

    #[tokio::test]
    async fn missing_query_is_bad_request() {
        let app = build_router(test_state(MockProvider::new("unused")));

        let response = app.oneshot(post_json("/query", json!({"sessionId": "s1"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "validation");
    }

    #[tokio::test]
    async fn blank_query_is_bad_request() {
        let app = build_router(test_state(MockProvider::new("unused")));

        let response = app.oneshot(post_json("/query", json!({"query": "   "}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let app = build_router(test_state(MockProvider::new("unused")));

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/query")
            .header("content-type", "application/json")
            .body(axum::body::Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn over_budget_prompt_is_payload_too_large() {
        let settings = PipelineSettings {
            budget_tokens: 8,
            ..PipelineSettings::default()
        };
        let state = test_state_with(MockProvider::new("unused"), Arc::new(mentorlink_retrieval::NoopRetriever), settings);
        let app = build_router(state);

        let response = app
            .oneshot(post_json("/query", json!({"query": "Explain the whole history of mathematics"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "assembly");
    }

    #[tokio::test]
    async fn model_failure_is_bad_gateway() {
        let provider = MockProvider::failing(ProviderError::AuthenticationFailed("bad key".into()));
        let app = build_router(test_state(provider));

        let response = app.oneshot(post_json("/query", json!({"query": "Hello?"}))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["stage"], "invocation");
        assert!(body["cause"].as_str().unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn failed_query_commits_nothing() {
        let provider = MockProvider::failing(ProviderError::AuthenticationFailed("bad key".into()));
        let state = test_state(provider);

        let response = build_router(state.clone())
            .oneshot(post_json("/query", json!({"sessionId": "s9", "query": "Hello?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        let response = build_router(state).oneshot(get("/sessions/s9")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn citations_come_from_the_index() {
        let index = KeywordIndex::new();
        index
            .add_document("biology.md", "Chlorophyll absorbs light during photosynthesis.")
            .await;
        let state = test_state_with(MockProvider::new("Light."), Arc::new(index), PipelineSettings::default());

        let response = build_router(state)
            .oneshot(post_json("/query", json!({"query": "What does chlorophyll absorb in photosynthesis?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let citations = body["citations"].as_array().unwrap();
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0]["source"], "biology.md");
    }

    #[tokio::test]
    async fn streaming_query_emits_sse_events() {
        let app = build_router(test_state(MockProvider::new("Streamed answer")));

        let response = app
            .oneshot(post_json("/query", json!({"sessionId": "s2", "query": "Stream it", "stream": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/event-stream"));

        let text = body_text(response).await;
        let start = text.find(r#""type":"start""#).unwrap();
        let chunk = text.find(r#""type":"chunk""#).unwrap();
        let done = text.find(r#""type":"done""#).unwrap();
        assert!(start < chunk && chunk < done);
        assert!(text.contains("Streamed answer"));
        assert!(!text.contains(r#""type":"error""#));
    }

    #[tokio::test]
    async fn streaming_failure_before_first_chunk_has_status() {
        let provider = MockProvider::failing(ProviderError::ModelNotFound("gpt-x".into()));
        let app = build_router(test_state(provider));

        let response = app
            .oneshot(post_json("/query", json!({"query": "Stream it", "stream": true})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn tutor_appends_learning_style_note() {
        let app = build_router(test_state(MockProvider::new("Forces change motion.")));

        let response = app
            .oneshot(post_json(
                "/tutor",
                json!({
                    "subject": "Physics",
                    "level": "Beginner",
                    "question": "What is a force?",
                    "learning_style": "Visual"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let text = body["response"].as_str().unwrap();
        assert!(text.starts_with("Forces change motion."));
        assert!(text.contains("Visualize these concepts"));
        assert!(!body["sessionId"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tutor_requires_subject() {
        let app = build_router(test_state(MockProvider::new("unused")));

        let response = app
            .oneshot(post_json("/tutor", json!({"subject": "", "level": "Beginner", "question": "Why?"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quiz_parses_model_output() {
        let app = build_router(test_state(MockProvider::new(QUIZ_JSON)));

        let response = app
            .oneshot(post_json(
                "/quiz",
                json!({"subject": "Math", "level": "Beginner", "num_questions": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let quiz = body["quiz"].as_array().unwrap();
        assert_eq!(quiz.len(), 2);
        assert_eq!(quiz[0]["correct_answer"], "4");
        assert_eq!(quiz[1]["explanation"], "The correct answer is 9.");
        assert_eq!(body["fallback"], false);
        assert!(body["formatted_quiz"].as_str().unwrap().contains("What is 2 + 2?"));
    }

    #[tokio::test]
    async fn quiz_without_reveal_format_omits_html() {
        let app = build_router(test_state(MockProvider::new(QUIZ_JSON)));

        let response = app
            .oneshot(post_json(
                "/quiz",
                json!({"subject": "Math", "level": "Beginner", "num_questions": 1, "reveal_format": false}),
            ))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["quiz"].as_array().unwrap().len(), 1);
        assert!(body.get("formatted_quiz").is_none());
    }

    #[tokio::test]
    async fn unusable_quiz_output_falls_back() {
        let app = build_router(test_state(MockProvider::new("Sorry, I cannot do that.")));

        let response = app
            .oneshot(post_json("/quiz", json!({"subject": "History", "level": "Advanced"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["fallback"], true);
        assert_eq!(body["quiz"].as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn quiz_question_count_is_bounded() {
        let app = build_router(test_state(MockProvider::new(QUIZ_JSON)));

        let response = app
            .oneshot(post_json(
                "/quiz",
                json!({"subject": "Math", "level": "Beginner", "num_questions": 11}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quiz_html_page() {
        let app = build_router(test_state(MockProvider::new(QUIZ_JSON)));

        let response = app.oneshot(get("/quiz-html/Math/Beginner/2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/html"));
        let html = body_text(response).await;
        assert!(html.contains("What is 3 x 3?"));
    }

    #[tokio::test]
    async fn unknown_session_not_found() {
        let app = build_router(test_state(MockProvider::new("unused")));

        let response = app.oneshot(get("/sessions/nonexistent")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn inspecting_unknown_session_leaves_store_untouched() {
        let store = Arc::new(InMemorySessionStore::with_capacity(1));
        let state = test_state_with_store(MockProvider::new("Kept."), store.clone());

        let response = build_router(state.clone())
            .oneshot(post_json("/query", json!({"sessionId": "real", "query": "Remember this"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(state.clone()).oneshot(get("/sessions/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(store.len().await, 1);

        let body = body_json(build_router(state.clone()).oneshot(get("/sessions")).await.unwrap()).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], "real");

        let response = build_router(state).oneshot(get("/sessions/real")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["turns"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn list_and_delete_sessions() {
        let state = test_state(MockProvider::new("Noted."));

        build_router(state.clone())
            .oneshot(post_json("/query", json!({"sessionId": "s3", "query": "Remember this"})))
            .await
            .unwrap();

        let response = build_router(state.clone()).oneshot(get("/sessions")).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["count"], 1);

        let delete = axum::http::Request::builder()
            .method("DELETE")
            .uri("/sessions/s3")
            .body(axum::body::Body::empty())
            .unwrap();
        let response = build_router(state.clone()).oneshot(delete).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = build_router(state).oneshot(get("/sessions/s3")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
