//! Orchestrator: drives one query through the pipeline.
//!
//! Stages, in order: validation → session (lease + snapshot) → retrieval →
//! assembly → invocation → commit. A failure at any stage leaves the
//! session untouched and is reported with the stage it happened in.
//!
//! The session lease is held from before the snapshot until the exchange is
//! committed or abandoned, so requests on one session run one at a time
//! while different sessions proceed in parallel.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use mentorlink_config::AppConfig;
use mentorlink_core::error::{Error, RetrievalError};
use mentorlink_core::event::{DomainEvent, EventBus};
use mentorlink_core::message::{Conversation, SessionId, Turn};
use mentorlink_core::provider::{ModelRequest, Usage};
use mentorlink_core::retrieval::{Fragment, RetrievalQuery, Retriever};
use mentorlink_core::session::{Exchange, SessionLease, SessionStore, TruncateLimit};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::{AssemblyInput, AssemblyMetadata, PromptAssembler};
use crate::invoker::{ModelEvent, ModelInvoker, ModelStream, RetryPolicy};
use crate::stream_event::QueryEvent;
use crate::tutor::TutorProfile;

const STREAM_BUFFER: usize = 32;

// ── Settings ──────────────────────────────────────────────────────────────

/// Everything the orchestrator reads from configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub system_instructions: String,
    pub budget_tokens: usize,
    pub max_query_chars: usize,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub top_k: usize,
    pub min_score: f32,
    pub retrieval_required: bool,
    pub retrieval_timeout: Duration,
    /// 0 keeps every turn.
    pub max_history_turns: usize,
    pub request_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let model = config
            .providers
            .get(&config.default_provider)
            .and_then(|p| p.default_model.clone())
            .unwrap_or_else(|| config.default_model.clone());
        Self {
            system_instructions: config.prompt.system_instructions.clone(),
            budget_tokens: config.prompt.budget_tokens,
            max_query_chars: config.prompt.max_query_chars,
            model,
            temperature: config.default_temperature,
            max_tokens: (config.default_max_tokens > 0).then_some(config.default_max_tokens),
            top_k: config.retrieval.top_k,
            min_score: config.retrieval.min_score,
            retrieval_required: config.retrieval.required,
            retrieval_timeout: Duration::from_millis(config.retrieval.timeout_ms),
            max_history_turns: config.session.max_history_turns,
            request_timeout: Duration::from_secs(config.gateway.request_timeout_secs),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

// ── Requests, outcomes, errors ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Validation,
    Session,
    Retrieval,
    Assembly,
    Invocation,
    Commit,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Validation => "validation",
            Stage::Session => "session",
            Stage::Retrieval => "retrieval",
            Stage::Assembly => "assembly",
            Stage::Invocation => "invocation",
            Stage::Commit => "commit",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed query: where it failed and why.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {source}")]
pub struct OrchestrationError {
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl OrchestrationError {
    pub fn new(stage: Stage, source: Error) -> Self {
        Self { stage, source }
    }

    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryRequest {
    /// Continue this session; a new one is created when absent.
    pub session_id: Option<SessionId>,
    pub query: String,
    pub stream: bool,
    pub profile: Option<TutorProfile>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_profile(mut self, profile: TutorProfile) -> Self {
        self.profile = Some(profile);
        self
    }
}

/// A committed, non-streamed answer.
#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub session_id: SessionId,
    pub answer: String,
    pub citations: Vec<Fragment>,
    pub retrieval_degraded: bool,
    pub usage: Option<Usage>,
    pub invocation_id: String,
    pub metadata: AssemblyMetadata,
}

pub enum Outcome {
    Answer(QueryAnswer),
    Stream(AnswerStream),
}

/// Events of a streamed answer, ending with `Done` or `Error`.
///
/// Dropping it aborts the invocation; nothing is committed.
pub struct AnswerStream {
    session_id: SessionId,
    rx: mpsc::Receiver<QueryEvent>,
    cancel: CancellationToken,
}

impl AnswerStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub async fn recv(&mut self) -> Option<QueryEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for AnswerStream {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Orchestrator ──────────────────────────────────────────────────────────

pub struct Orchestrator {
    store: Arc<dyn SessionStore>,
    retriever: Arc<dyn Retriever>,
    invoker: ModelInvoker,
    assembler: PromptAssembler,
    settings: PipelineSettings,
    events: Arc<EventBus>,
}

/// State carried from the prepare stages into invocation and commit.
struct Prepared {
    session_id: SessionId,
    query: String,
    citations: Vec<Fragment>,
    retrieval_degraded: bool,
    metadata: AssemblyMetadata,
    suffix: String,
    started: Instant,
    deadline: Instant,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        retriever: Arc<dyn Retriever>,
        invoker: ModelInvoker,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            retriever,
            invoker,
            assembler: PromptAssembler::new(settings.budget_tokens),
            settings,
            events: Arc::new(EventBus::default()),
        }
    }

    /// Wire everything from configuration around an already-built provider.
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn SessionStore>,
        retriever: Arc<dyn Retriever>,
        provider: Arc<dyn mentorlink_core::provider::Provider>,
    ) -> Self {
        let invoker = ModelInvoker::new(provider).with_policy(RetryPolicy::from_config(&config.invoker));
        Self::new(store, retriever, invoker, PipelineSettings::from_config(config))
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn invoker(&self) -> &ModelInvoker {
        &self.invoker
    }

    pub fn retriever_name(&self) -> &str {
        self.retriever.name()
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    fn committer(&self) -> Committer {
        Committer {
            store: self.store.clone(),
            events: self.events.clone(),
            max_history_turns: self.settings.max_history_turns,
        }
    }

    /// Handle one query. `cancel` aborts it at the next suspension point.
    pub async fn handle(&self, request: QueryRequest, cancel: CancellationToken) -> Result<Outcome, OrchestrationError> {
        let session_id = request.session_id.clone().unwrap_or_default();
        let result = self.run(request, session_id.clone(), cancel).await;
        if let Err(e) = &result {
            report_failure(&self.events, &session_id, e.stage, &e.source);
        }
        result
    }

    async fn run(
        &self,
        request: QueryRequest,
        session_id: SessionId,
        cancel: CancellationToken,
    ) -> Result<Outcome, OrchestrationError> {
        let started = Instant::now();
        let deadline = started + self.settings.request_timeout;

        // ── Validation ──
        let query = validate_query(&request, self.settings.max_query_chars)
            .map_err(|e| OrchestrationError::new(Stage::Validation, e))?;

        // ── Session ──
        let lease = staged(Stage::Session, deadline, &cancel, async {
            Ok::<_, Error>(self.store.lock(&session_id).await)
        })
        .await?;
        let conversation = staged(Stage::Session, deadline, &cancel, async {
            // A request that fails must not leave a new session behind.
            let found = self.store.find(&session_id).await.map_err(Error::from)?;
            Ok::<_, Error>(found.unwrap_or_else(|| Conversation::new(session_id.clone())))
        })
        .await?;

        // ── Retrieval ──
        let (fragments, retrieval_degraded) =
            staged(Stage::Retrieval, deadline, &cancel, self.retrieve(&session_id, &query)).await?;

        // ── Assembly ──
        let system = match &request.profile {
            Some(profile) => profile.system_instructions(&self.settings.system_instructions),
            None => self.settings.system_instructions.clone(),
        };
        let assembled = self
            .assembler
            .assemble(&AssemblyInput {
                system_instructions: &system,
                history: &conversation.turns,
                fragments: &fragments,
                query: &query,
            })
            .map_err(|e| OrchestrationError::new(Stage::Assembly, e.into()))?;
        debug!(
            session_id = %session_id,
            total_tokens = assembled.metadata.total_tokens,
            budget = assembled.metadata.budget,
            fragments = assembled.included_fragments.len(),
            "Prompt assembled"
        );

        let model_request = ModelRequest::new(&self.settings.model, assembled.messages, self.settings.budget_tokens)
            .with_temperature(self.settings.temperature)
            .with_max_tokens(self.settings.max_tokens);

        let prepared = Prepared {
            session_id,
            query,
            citations: assembled.included_fragments,
            retrieval_degraded,
            metadata: assembled.metadata,
            suffix: request.profile.as_ref().map(TutorProfile::suffix).unwrap_or_default(),
            started,
            deadline,
        };

        // ── Invocation + commit ──
        if request.stream {
            let stream = self.invoker.stream_until(model_request, &cancel, prepared.deadline);
            self.open_stream(prepared, stream, lease, cancel).await
        } else {
            let completion = staged(
                Stage::Invocation,
                deadline,
                &cancel,
                self.invoker.complete(model_request, &cancel),
            )
            .await?;

            let answer = format!("{}{}", completion.text, prepared.suffix);
            self.committer()
                .commit(&prepared, &completion.invocation_id, &answer)
                .await
                .map_err(|e| OrchestrationError::new(Stage::Commit, e))?;
            drop(lease);

            publish_completed(&self.events, &prepared, &completion.invocation_id, false, completion.usage);
            Ok(Outcome::Answer(QueryAnswer {
                session_id: prepared.session_id,
                answer,
                citations: prepared.citations,
                retrieval_degraded: prepared.retrieval_degraded,
                usage: completion.usage,
                invocation_id: completion.invocation_id,
                metadata: prepared.metadata,
            }))
        }
    }

    /// Retrieve fragments, degrading to none unless retrieval is required.
    async fn retrieve(&self, session_id: &SessionId, query: &str) -> Result<(Vec<Fragment>, bool), Error> {
        let request = RetrievalQuery::new(query)
            .with_top_k(self.settings.top_k)
            .with_min_score(self.settings.min_score);
        let limit = self.settings.retrieval_timeout;

        let error = match tokio::time::timeout(limit, self.retriever.retrieve(&request)).await {
            Ok(Ok(fragments)) => {
                debug!(session_id = %session_id, retriever = self.retriever.name(), count = fragments.len(), "Retrieved fragments");
                return Ok((fragments, false));
            }
            Ok(Err(e)) => e,
            Err(_) => RetrievalError::Timeout(limit.as_millis() as u64),
        };

        if self.settings.retrieval_required {
            return Err(Error::RetrievalUnavailable(error));
        }
        warn!(
            session_id = %session_id,
            retriever = self.retriever.name(),
            error = %error,
            "Retrieval unavailable, continuing without fragments"
        );
        self.events.publish(DomainEvent::RetrievalDegraded {
            session_id: session_id.to_string(),
            reason: error.to_string(),
            timestamp: Utc::now(),
        });
        Ok((Vec::new(), true))
    }

    /// Wait for the first model event, then hand the rest to a stream task.
    ///
    /// A failure before any text is returned as an error so the caller can
    /// still answer with a status code.
    async fn open_stream(
        &self,
        prepared: Prepared,
        mut stream: ModelStream,
        lease: SessionLease,
        cancel: CancellationToken,
    ) -> Result<Outcome, OrchestrationError> {
        let first = staged(Stage::Invocation, prepared.deadline, &cancel, async {
            match stream.recv().await {
                Some(event @ (ModelEvent::Delta(_) | ModelEvent::Completed { .. })) => Ok(event),
                Some(other) => Err(other.into_error().unwrap_or(Error::Cancelled)),
                None => Err(Error::Internal("model stream closed without a result".into())),
            }
        })
        .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stream_cancel = cancel.child_token();
        let session_id = prepared.session_id.clone();
        let task = StreamTask {
            committer: self.committer(),
            events: self.events.clone(),
            invocation_id: stream.invocation_id().to_string(),
            prepared,
            stream,
            lease: Some(lease),
            tx,
            cancel: stream_cancel.clone(),
            chunks: 0,
        };
        tokio::spawn(task.run(first));

        Ok(Outcome::Stream(AnswerStream {
            session_id,
            rx,
            cancel: stream_cancel,
        }))
    }
}

fn validate_query(request: &QueryRequest, max_chars: usize) -> Result<String, Error> {
    if let Some(id) = &request.session_id {
        if id.as_str().trim().is_empty() {
            return Err(Error::Validation("sessionId must not be blank".into()));
        }
    }
    let query = request.query.trim();
    if query.is_empty() {
        return Err(Error::Validation("query must not be empty".into()));
    }
    let chars = query.chars().count();
    if chars > max_chars {
        return Err(Error::Validation(format!(
            "query is {chars} characters, the limit is {max_chars}"
        )));
    }
    Ok(query.to_string())
}

/// Run one stage under the request deadline and cancellation.
async fn staged<T>(
    stage: Stage,
    deadline: Instant,
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, OrchestrationError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestrationError::new(stage, Error::Cancelled)),
        r = tokio::time::timeout_at(deadline, fut) => match r {
            Ok(result) => result.map_err(|e| OrchestrationError::new(stage, e)),
            Err(_) => Err(OrchestrationError::new(
                stage,
                Error::DeadlineExceeded(format!("request deadline passed during {stage}")),
            )),
        },
    }
}

fn report_failure(events: &EventBus, session_id: &SessionId, stage: Stage, error: &Error) {
    if error.is_cancelled() {
        debug!(session_id = %session_id, stage = %stage, "Query cancelled");
        events.publish(DomainEvent::QueryCancelled {
            session_id: session_id.to_string(),
            stage: stage.to_string(),
            timestamp: Utc::now(),
        });
    } else {
        warn!(session_id = %session_id, stage = %stage, error = %error, "Query failed");
        events.publish(DomainEvent::QueryFailed {
            session_id: session_id.to_string(),
            stage: stage.to_string(),
            error_message: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

fn publish_completed(events: &EventBus, prepared: &Prepared, invocation_id: &str, streamed: bool, usage: Option<Usage>) {
    let duration_ms = prepared.started.elapsed().as_millis() as u64;
    info!(
        session_id = %prepared.session_id,
        invocation_id,
        streamed,
        fragments = prepared.citations.len(),
        duration_ms,
        "Query completed"
    );
    events.publish(DomainEvent::QueryCompleted {
        session_id: prepared.session_id.to_string(),
        invocation_id: invocation_id.to_string(),
        streamed,
        fragments_used: prepared.citations.len(),
        retrieval_degraded: prepared.retrieval_degraded,
        tokens_used: usage.map(|u| u.total_tokens).unwrap_or(0),
        duration_ms,
        timestamp: Utc::now(),
    });
}

// ── Commit ────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Committer {
    store: Arc<dyn SessionStore>,
    events: Arc<EventBus>,
    max_history_turns: usize,
}

impl Committer {
    /// Store the exchange, then enforce the history bound.
    async fn commit(&self, prepared: &Prepared, invocation_id: &str, answer: &str) -> Result<(), Error> {
        let citations = prepared.citations.iter().map(|f| f.id.clone()).collect();
        let exchange = Exchange::new(
            invocation_id,
            Turn::user(prepared.query.clone()),
            Turn::assistant(answer).with_citations(citations),
        );
        if !self.store.commit_exchange(&prepared.session_id, exchange).await? {
            debug!(session_id = %prepared.session_id, invocation_id, "Exchange was already committed");
        }

        if self.max_history_turns > 0 {
            match self
                .store
                .truncate(&prepared.session_id, TruncateLimit::MaxTurns(self.max_history_turns))
                .await
            {
                Ok(0) => {}
                Ok(dropped) => {
                    debug!(session_id = %prepared.session_id, dropped, "History truncated");
                    self.events.publish(DomainEvent::SessionTruncated {
                        session_id: prepared.session_id.to_string(),
                        dropped,
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => warn!(session_id = %prepared.session_id, error = %e, "History truncation failed"),
            }
        }
        Ok(())
    }
}

// ── Stream task ───────────────────────────────────────────────────────────

enum Next {
    Cancelled,
    Deadline,
    Event(Option<ModelEvent>),
}

enum Sent {
    Delivered,
    Closed,
    Deadline,
}

struct StreamTask {
    committer: Committer,
    events: Arc<EventBus>,
    invocation_id: String,
    prepared: Prepared,
    stream: ModelStream,
    /// Held until the exchange is committed or abandoned.
    lease: Option<SessionLease>,
    tx: mpsc::Sender<QueryEvent>,
    cancel: CancellationToken,
    chunks: usize,
}

impl StreamTask {
    async fn run(mut self, first: ModelEvent) {
        let start = QueryEvent::Start {
            session_id: self.prepared.session_id.to_string(),
            invocation_id: self.invocation_id.clone(),
            citations: self.prepared.citations.clone(),
            retrieval_degraded: self.prepared.retrieval_degraded,
        };
        if !self.forward(start).await {
            return;
        }

        let mut pending = Some(first);
        loop {
            let event = match pending.take() {
                Some(event) => event,
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => Next::Cancelled,
                        _ = tokio::time::sleep_until(self.prepared.deadline) => Next::Deadline,
                        event = self.stream.recv() => Next::Event(event),
                    };
                    match next {
                        Next::Cancelled => {
                            self.cancelled();
                            return;
                        }
                        Next::Deadline => {
                            self.fail(Error::DeadlineExceeded("request deadline passed while streaming".into()))
                                .await;
                            return;
                        }
                        Next::Event(None) => {
                            self.fail(Error::Internal("model stream closed without a result".into())).await;
                            return;
                        }
                        Next::Event(Some(event)) => event,
                    }
                }
            };

            match event {
                ModelEvent::Delta(content) => {
                    self.chunks += 1;
                    if !self.forward(QueryEvent::Chunk { content }).await {
                        return;
                    }
                }
                ModelEvent::Completed { text, usage } => {
                    self.complete(text, usage).await;
                    return;
                }
                ModelEvent::Cancelled => {
                    self.cancelled();
                    return;
                }
                failed => {
                    let error = failed
                        .into_error()
                        .unwrap_or_else(|| Error::Internal("unexpected model event".into()));
                    self.fail(error).await;
                    return;
                }
            }
        }
    }

    /// Forward a non-terminal event. Returns `false` once the stream has
    /// been abandoned, either because the client went away or because it
    /// stopped reading past the request deadline.
    async fn forward(&mut self, event: QueryEvent) -> bool {
        match self.send(event).await {
            Sent::Delivered => true,
            Sent::Closed => {
                self.cancelled();
                false
            }
            Sent::Deadline => {
                self.fail(Error::DeadlineExceeded(
                    "request deadline passed while the client was not reading".into(),
                ))
                .await;
                false
            }
        }
    }

    async fn send(&self, event: QueryEvent) -> Sent {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Sent::Closed,
            _ = tokio::time::sleep_until(self.prepared.deadline) => Sent::Deadline,
            r = self.tx.send(event) => if r.is_ok() { Sent::Delivered } else { Sent::Closed },
        }
    }

    /// Deliver the last event if the client takes it before the deadline.
    /// The lease must already be released.
    async fn send_terminal(&self, event: QueryEvent) {
        tokio::select! {
            biased;
            _ = self.tx.send(event) => {}
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep_until(self.prepared.deadline) => {}
        }
    }

    async fn complete(&mut self, mut answer: String, usage: Option<Usage>) {
        if self.cancel.is_cancelled() || self.tx.is_closed() {
            self.cancelled();
            return;
        }
        if !self.prepared.suffix.is_empty() {
            let suffix = self.prepared.suffix.clone();
            answer.push_str(&suffix);
            self.chunks += 1;
            if !self.forward(QueryEvent::Chunk { content: suffix }).await {
                return;
            }
        }

        let committed = self.committer.commit(&self.prepared, &self.invocation_id, &answer).await;
        self.lease = None;
        if let Err(e) = committed {
            report_failure(&self.events, &self.prepared.session_id, Stage::Commit, &e);
            let event = QueryEvent::Error {
                stage: Stage::Commit,
                message: e.to_string(),
                delivered_chunks: self.chunks,
            };
            self.send_terminal(event).await;
            return;
        }

        publish_completed(&self.events, &self.prepared, &self.invocation_id, true, usage);
        let done = QueryEvent::Done {
            session_id: self.prepared.session_id.to_string(),
            invocation_id: self.invocation_id.clone(),
            usage,
            chunks: self.chunks,
        };
        self.send_terminal(done).await;
    }

    async fn fail(&mut self, error: Error) {
        self.stream.cancel();
        self.lease = None;
        report_failure(&self.events, &self.prepared.session_id, Stage::Invocation, &error);
        let event = QueryEvent::Error {
            stage: Stage::Invocation,
            message: error.to_string(),
            delivered_chunks: self.chunks,
        };
        self.send_terminal(event).await;
    }

    fn cancelled(&mut self) {
        self.stream.cancel();
        self.lease = None;
        report_failure(&self.events, &self.prepared.session_id, Stage::Invocation, &Error::Cancelled);
    }
}
