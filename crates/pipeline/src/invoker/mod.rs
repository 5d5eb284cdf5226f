//! Model invoker: one logical model call with retries, deadlines and
//! cancellation.
//!
//! Non-streaming calls retry any transient failure until the attempt budget
//! runs out. Streaming calls retry only while nothing has been delivered:
//! after the first delta the invocation is committed and a later failure
//! is reported as an interruption instead.

pub mod retry;
pub mod state;

pub use retry::RetryPolicy;
pub use state::{InvalidTransition, Invocation, InvocationState};

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use mentorlink_core::error::{Error, ProviderError};
use mentorlink_core::provider::{ModelRequest, Provider, Usage};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Events buffered between the producer task and the consumer.
const STREAM_BUFFER: usize = 32;

/// A finished non-streaming call.
#[derive(Debug, Clone)]
pub struct Completion {
    pub invocation_id: String,
    pub text: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub attempts: u32,
}

/// What a streaming invocation emits, in order: any number of `Delta`s,
/// then exactly one terminal event.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    Delta(String),
    Completed {
        text: String,
        usage: Option<Usage>,
    },
    Failed {
        error: ProviderError,
        attempts: u32,
        delivered_chunks: usize,
        delivered_chars: usize,
    },
    Cancelled,
}

impl ModelEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ModelEvent::Delta(_))
    }

    /// The pipeline error for a failed or cancelled invocation.
    pub fn into_error(self) -> Option<Error> {
        match self {
            ModelEvent::Failed {
                error,
                attempts,
                delivered_chunks,
                delivered_chars,
            } => Some(if delivered_chunks == 0 {
                Error::ModelTransport { attempts, source: error }
            } else {
                Error::StreamInterrupted {
                    delivered_chunks,
                    delivered_chars,
                    source: error,
                }
            }),
            ModelEvent::Cancelled => Some(Error::Cancelled),
            _ => None,
        }
    }
}

/// Consumer side of a streaming invocation.
///
/// Dropping it cancels the invocation and releases the provider connection.
pub struct ModelStream {
    invocation_id: String,
    rx: mpsc::Receiver<ModelEvent>,
    cancel: CancellationToken,
}

impl ModelStream {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub async fn recv(&mut self) -> Option<ModelEvent> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for ModelStream {
    type Item = ModelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ModelStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub enum ModelResponse {
    Complete(Completion),
    Streaming(ModelStream),
}

/// Sends model requests through a provider under a [`RetryPolicy`].
#[derive(Clone)]
pub struct ModelInvoker {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
}

impl ModelInvoker {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn health_check(&self) -> Result<bool, ProviderError> {
        self.provider.health_check().await
    }

    pub async fn invoke(
        &self,
        request: ModelRequest,
        streaming: bool,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, Error> {
        if streaming {
            Ok(ModelResponse::Streaming(self.stream(request, cancel)))
        } else {
            self.complete(request, cancel).await.map(ModelResponse::Complete)
        }
    }

    /// Complete a request, retrying transient failures.
    pub async fn complete(&self, mut request: ModelRequest, cancel: &CancellationToken) -> Result<Completion, Error> {
        request.stream = false;
        let mut invocation = Invocation::new();

        loop {
            invocation.begin_attempt()?;
            debug!(
                invocation_id = invocation.id(),
                attempt = invocation.attempts(),
                provider = self.provider.name(),
                model = %request.model,
                "Sending model request"
            );

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    invocation.cancel();
                    debug!(invocation_id = invocation.id(), "Model request cancelled");
                    return Err(Error::Cancelled);
                }
                r = tokio::time::timeout(self.policy.attempt_timeout, self.provider.complete(request.clone())) => r,
            };

            let error = match outcome {
                Ok(Ok(response)) => {
                    invocation.complete()?;
                    info!(
                        invocation_id = invocation.id(),
                        attempts = invocation.attempts(),
                        model = %response.model,
                        "Model request completed"
                    );
                    return Ok(Completion {
                        invocation_id: invocation.id().to_string(),
                        text: response.content,
                        usage: response.usage,
                        model: response.model,
                        attempts: invocation.attempts(),
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => timeout_error(self.policy.attempt_timeout),
            };

            if !error.is_transient() || !invocation.can_retry(self.policy.max_attempts) {
                invocation.fail()?;
                warn!(
                    invocation_id = invocation.id(),
                    attempts = invocation.attempts(),
                    error = %error,
                    "Model request failed"
                );
                return Err(Error::ModelTransport {
                    attempts: invocation.attempts(),
                    source: error,
                });
            }

            let wait = self.policy.delay(invocation.attempts(), &error);
            warn!(
                invocation_id = invocation.id(),
                attempt = invocation.attempts(),
                error = %error,
                wait_ms = wait.as_millis() as u64,
                "Model request failed, retrying"
            );
            if wait_or_cancel(wait, cancel).await {
                invocation.cancel();
                return Err(Error::Cancelled);
            }
        }
    }

    /// Start a streaming invocation on a background task.
    ///
    /// Cancelling `cancel`, calling [`ModelStream::cancel`] or dropping the
    /// returned stream all stop the producer.
    pub fn stream(&self, request: ModelRequest, cancel: &CancellationToken) -> ModelStream {
        self.spawn_stream(request, cancel, None)
    }

    /// Like [`ModelInvoker::stream`], but the producer gives up at
    /// `deadline`, even when it is blocked on a consumer that stopped
    /// reading.
    pub fn stream_until(&self, request: ModelRequest, cancel: &CancellationToken, deadline: Instant) -> ModelStream {
        self.spawn_stream(request, cancel, Some(deadline))
    }

    fn spawn_stream(&self, mut request: ModelRequest, cancel: &CancellationToken, deadline: Option<Instant>) -> ModelStream {
        request.stream = true;
        let invocation = Invocation::new();
        let invocation_id = invocation.id().to_string();
        let token = cancel.child_token();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);

        let run = StreamRun {
            provider: self.provider.clone(),
            policy: self.policy.clone(),
            request,
            invocation,
            tx,
            cancel: token.clone(),
            deadline,
            text: String::new(),
            usage: None,
        };
        tokio::spawn(run.run());

        ModelStream {
            invocation_id,
            rx,
            cancel: token,
        }
    }
}

fn timeout_error(limit: Duration) -> ProviderError {
    ProviderError::Timeout(format!("no response within {limit:?}"))
}

/// Sleep for `wait`. Returns `true` if cancelled first.
async fn wait_or_cancel(wait: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(wait) => false,
    }
}

/// Resolves at `deadline`, or never when there is none.
async fn deadline_passed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ── Streaming producer ────────────────────────────────────────────────────

enum Attempt {
    Completed,
    Cancelled,
    Expired,
    Failed(ProviderError),
}

struct StreamRun {
    provider: Arc<dyn Provider>,
    policy: RetryPolicy,
    request: ModelRequest,
    invocation: Invocation,
    tx: mpsc::Sender<ModelEvent>,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    text: String,
    usage: Option<Usage>,
}

impl StreamRun {
    async fn run(mut self) {
        loop {
            if let Err(e) = self.invocation.begin_attempt() {
                self.finish_failed(ProviderError::InvalidResponse(e.to_string())).await;
                return;
            }
            self.usage = None;

            let error = match self.attempt().await {
                Attempt::Completed => {
                    self.finish_completed().await;
                    return;
                }
                Attempt::Cancelled => {
                    self.finish_cancelled();
                    return;
                }
                Attempt::Expired => {
                    self.finish_expired();
                    return;
                }
                Attempt::Failed(e) => e,
            };

            if !error.is_transient() || !self.invocation.can_retry(self.policy.max_attempts) {
                self.finish_failed(error).await;
                return;
            }

            let wait = self.policy.delay(self.invocation.attempts(), &error);
            warn!(
                invocation_id = self.invocation.id(),
                attempt = self.invocation.attempts(),
                error = %error,
                wait_ms = wait.as_millis() as u64,
                "Model stream failed before first chunk, retrying"
            );
            let interrupted = tokio::select! {
                biased;
                _ = deadline_passed(self.deadline) => Some(Attempt::Expired),
                cancelled = wait_or_cancel(wait, &self.cancel) => cancelled.then_some(Attempt::Cancelled),
            };
            match interrupted {
                Some(Attempt::Expired) => {
                    self.finish_expired();
                    return;
                }
                Some(_) => {
                    self.finish_cancelled();
                    return;
                }
                None => {}
            }
        }
    }

    async fn attempt(&mut self) -> Attempt {
        debug!(
            invocation_id = self.invocation.id(),
            attempt = self.invocation.attempts(),
            provider = self.provider.name(),
            "Opening model stream"
        );

        let limit = self.policy.attempt_timeout;
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Attempt::Cancelled,
            _ = deadline_passed(self.deadline) => return Attempt::Expired,
            r = tokio::time::timeout(limit, self.provider.stream(self.request.clone())) => r,
        };
        let mut chunks = match opened {
            Ok(Ok(rx)) => rx,
            Ok(Err(e)) => return Attempt::Failed(e),
            Err(_) => return Attempt::Failed(timeout_error(limit)),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Attempt::Cancelled,
                _ = self.tx.closed() => return Attempt::Cancelled,
                _ = deadline_passed(self.deadline) => return Attempt::Expired,
                r = tokio::time::timeout(limit, chunks.recv()) => r,
            };
            let chunk = match next {
                Err(_) => return Attempt::Failed(timeout_error(limit)),
                Ok(None) => {
                    return Attempt::Failed(ProviderError::StreamInterrupted(
                        "provider stream ended without completion".into(),
                    ));
                }
                Ok(Some(Err(e))) => return Attempt::Failed(e),
                Ok(Some(Ok(chunk))) => chunk,
            };

            if let Some(content) = chunk.content.filter(|c| !c.is_empty()) {
                if let Err(e) = self.invocation.record_delivery(content.chars().count()) {
                    return Attempt::Failed(ProviderError::InvalidResponse(e.to_string()));
                }
                self.text.push_str(&content);
                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Attempt::Cancelled,
                    _ = deadline_passed(self.deadline) => return Attempt::Expired,
                    r = self.tx.send(ModelEvent::Delta(content)) => r,
                };
                if sent.is_err() {
                    return Attempt::Cancelled;
                }
            }
            if chunk.usage.is_some() {
                self.usage = chunk.usage;
            }
            if chunk.done {
                return Attempt::Completed;
            }
        }
    }

    async fn finish_completed(&mut self) {
        if let Err(e) = self.invocation.complete() {
            warn!(invocation_id = self.invocation.id(), error = %e, "Unexpected invocation state");
        }
        info!(
            invocation_id = self.invocation.id(),
            attempts = self.invocation.attempts(),
            chunks = self.invocation.delivered_chunks(),
            "Model stream completed"
        );
        let event = ModelEvent::Completed {
            text: std::mem::take(&mut self.text),
            usage: self.usage,
        };
        self.send_terminal(event).await;
    }

    async fn finish_failed(&mut self, error: ProviderError) {
        if let Err(e) = self.invocation.fail() {
            warn!(invocation_id = self.invocation.id(), error = %e, "Unexpected invocation state");
        }
        warn!(
            invocation_id = self.invocation.id(),
            attempts = self.invocation.attempts(),
            delivered_chunks = self.invocation.delivered_chunks(),
            error = %error,
            "Model stream failed"
        );
        let event = ModelEvent::Failed {
            error,
            attempts: self.invocation.attempts(),
            delivered_chunks: self.invocation.delivered_chunks(),
            delivered_chars: self.invocation.delivered_chars(),
        };
        self.send_terminal(event).await;
    }

    /// The deadline passed: report a timeout if there is room for it.
    fn finish_expired(&mut self) {
        if let Err(e) = self.invocation.fail() {
            warn!(invocation_id = self.invocation.id(), error = %e, "Unexpected invocation state");
        }
        warn!(
            invocation_id = self.invocation.id(),
            delivered_chunks = self.invocation.delivered_chunks(),
            "Model stream abandoned at the request deadline"
        );
        let event = ModelEvent::Failed {
            error: ProviderError::Timeout("request deadline passed".into()),
            attempts: self.invocation.attempts(),
            delivered_chunks: self.invocation.delivered_chunks(),
            delivered_chars: self.invocation.delivered_chars(),
        };
        let _ = self.tx.try_send(event);
    }

    async fn send_terminal(&self, event: ModelEvent) {
        tokio::select! {
            biased;
            _ = self.tx.send(event) => {}
            _ = self.cancel.cancelled() => {}
            _ = deadline_passed(self.deadline) => {}
        }
    }

    fn finish_cancelled(&mut self) {
        self.invocation.cancel();
        debug!(
            invocation_id = self.invocation.id(),
            delivered_chunks = self.invocation.delivered_chunks(),
            "Model stream cancelled"
        );
        let _ = self.tx.try_send(ModelEvent::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Piece, ScriptedProvider};
    use mentorlink_core::provider::PromptMessage;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            attempt_timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            jitter: false,
        }
    }

    fn request() -> ModelRequest {
        ModelRequest::new("test-model", vec![PromptMessage::user("hello")], 4096)
    }

    fn invoker(provider: &Arc<ScriptedProvider>, max_attempts: u32) -> ModelInvoker {
        ModelInvoker::new(provider.clone()).with_policy(policy(max_attempts))
    }

    async fn drain(stream: &mut ModelStream) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }

    // ── Non-streaming ──

    #[tokio::test]
    async fn completes_first_try() {
        let provider = Arc::new(ScriptedProvider::new().text("Paris"));
        let out = invoker(&provider, 3)
            .complete(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.text, "Paris");
        assert_eq!(out.attempts, 1);
        assert_eq!(provider.calls(), 1);
        assert!(!provider.requests()[0].stream);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_twice_then_succeeds() {
        let provider = Arc::new(ScriptedProvider::new().hang().hang().text("finally"));
        let out = invoker(&provider, 3)
            .complete(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.text, "finally");
        assert_eq!(out.attempts, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .fail(ProviderError::Network("reset".into()))
                .fail(ProviderError::Network("reset".into()))
                .fail(ProviderError::Network("reset".into())),
        );
        let err = invoker(&provider, 3)
            .complete(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelTransport { attempts: 3, source: ProviderError::Network(_) }));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_error_fails_fast() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .fail(ProviderError::AuthenticationFailed("bad key".into()))
                .text("never reached"),
        );
        let err = invoker(&provider, 3)
            .complete(request(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ModelTransport { attempts: 1, .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .fail(ProviderError::ApiError {
                    status_code: 503,
                    message: "overloaded".into(),
                })
                .text("ok"),
        );
        let out = invoker(&provider, 3)
            .complete(request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_hanging_attempt() {
        let provider = Arc::new(ScriptedProvider::new().hang());
        let invoker = ModelInvoker::new(provider.clone()).with_policy(RetryPolicy {
            attempt_timeout: Duration::from_secs(600),
            ..policy(3)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = invoker.complete(request(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff() {
        let provider = Arc::new(ScriptedProvider::new().fail(ProviderError::Timeout("t".into())).text("late"));
        let invoker = ModelInvoker::new(provider.clone()).with_policy(RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            ..policy(3)
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let err = invoker.complete(request(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(provider.calls(), 1);
    }

    // ── Streaming ──

    #[tokio::test]
    async fn stream_delivers_deltas_then_completion() {
        let provider = Arc::new(ScriptedProvider::new().stream(vec![
            Piece::text("The capital "),
            Piece::text("is Paris."),
            Piece::Done,
        ]));
        let mut stream = invoker(&provider, 3).stream(request(), &CancellationToken::new());
        let events = drain(&mut stream).await;

        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ModelEvent::Delta(t) if t == "The capital "));
        assert!(matches!(&events[1], ModelEvent::Delta(t) if t == "is Paris."));
        match &events[2] {
            ModelEvent::Completed { text, usage } => {
                assert_eq!(text, "The capital is Paris.");
                assert!(usage.is_some());
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(provider.requests()[0].stream);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_retries_before_first_chunk() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_fails(ProviderError::Network("refused".into()))
                .stream(vec![Piece::Error(ProviderError::Timeout("slow".into()))])
                .stream(vec![Piece::text("ok"), Piece::Done]),
        );
        let mut stream = invoker(&provider, 3).stream(request(), &CancellationToken::new());
        let events = drain(&mut stream).await;

        assert!(matches!(&events[0], ModelEvent::Delta(t) if t == "ok"));
        assert!(matches!(&events[1], ModelEvent::Completed { .. }));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn stream_failure_after_delivery_is_not_retried() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream(vec![Piece::text("Hel"), Piece::Error(ProviderError::Network("reset".into()))])
                .stream(vec![Piece::text("Hello"), Piece::Done]),
        );
        let mut stream = invoker(&provider, 3).stream(request(), &CancellationToken::new());
        let events = drain(&mut stream).await;

        assert_eq!(events.len(), 2);
        assert_eq!(provider.calls(), 1);
        let err = events[1].clone().into_error().unwrap();
        assert!(matches!(
            err,
            Error::StreamInterrupted { delivered_chunks: 1, delivered_chars: 3, .. }
        ));
    }

    #[tokio::test]
    async fn three_chunks_then_connection_drop() {
        let provider = Arc::new(ScriptedProvider::new().stream(vec![
            Piece::text("Water "),
            Piece::text("boils at "),
            Piece::text("100 C"),
            Piece::Error(ProviderError::Network("connection reset".into())),
        ]));
        let mut stream = invoker(&provider, 3).stream(request(), &CancellationToken::new());
        let events = drain(&mut stream).await;

        assert_eq!(events.len(), 4);
        let text: Vec<&str> = events[..3]
            .iter()
            .map(|e| match e {
                ModelEvent::Delta(t) => t.as_str(),
                other => panic!("expected a delta, got {other:?}"),
            })
            .collect();
        assert_eq!(text, vec!["Water ", "boils at ", "100 C"]);
        assert!(matches!(
            events[3].clone().into_error(),
            Some(Error::StreamInterrupted { delivered_chunks: 3, delivered_chars: 20, .. })
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_consumer_is_abandoned_at_deadline() {
        let mut pieces: Vec<Piece> = (0..40).map(|i| Piece::Text(format!("w{i} "))).collect();
        pieces.push(Piece::Stall);
        let provider = Arc::new(ScriptedProvider::new().stream(pieces));
        let invoker = ModelInvoker::new(provider.clone()).with_policy(RetryPolicy {
            attempt_timeout: Duration::from_secs(600),
            ..policy(1)
        });
        let deadline = Instant::now() + Duration::from_secs(1);
        let mut stream = invoker.stream_until(request(), &CancellationToken::new(), deadline);

        // Nobody reads until the producer has given up.
        for _ in 0..100 {
            if provider.released_streams() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(provider.released_streams(), 1);

        let events = drain(&mut stream).await;
        assert_eq!(events.len(), STREAM_BUFFER);
        assert!(events.iter().all(|e| matches!(e, ModelEvent::Delta(_))));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_interruption() {
        let provider = Arc::new(ScriptedProvider::new().stream(vec![Piece::text("partial")]));
        let mut stream = invoker(&provider, 3).stream(request(), &CancellationToken::new());
        let events = drain(&mut stream).await;
        match &events[1] {
            ModelEvent::Failed { error, delivered_chunks, .. } => {
                assert!(matches!(error, ProviderError::StreamInterrupted(_)));
                assert_eq!(*delivered_chunks, 1);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stream_exhausts_attempts_before_delivery() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .stream_fails(ProviderError::Network("a".into()))
                .stream_fails(ProviderError::Network("b".into())),
        );
        let mut stream = invoker(&provider, 2).stream(request(), &CancellationToken::new());
        let events = drain(&mut stream).await;
        assert_eq!(events.len(), 1);
        let err = events[0].clone().into_error().unwrap();
        assert!(matches!(err, Error::ModelTransport { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_stream_releases_provider() {
        let provider = Arc::new(ScriptedProvider::new().stream(vec![Piece::text("first"), Piece::Stall]));
        let mut stream = invoker(&provider, 1).stream(request(), &CancellationToken::new());
        assert!(matches!(stream.recv().await, Some(ModelEvent::Delta(_))));
        drop(stream);

        for _ in 0..100 {
            if provider.released_streams() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(provider.released_streams(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancel_stops_stream() {
        let provider = Arc::new(ScriptedProvider::new().stream(vec![Piece::text("first"), Piece::Stall]));
        let cancel = CancellationToken::new();
        let mut stream = ModelInvoker::new(provider.clone())
            .with_policy(RetryPolicy {
                attempt_timeout: Duration::from_secs(600),
                ..policy(1)
            })
            .stream(request(), &cancel);
        assert!(matches!(stream.recv().await, Some(ModelEvent::Delta(_))));
        cancel.cancel();
        let events = drain(&mut stream).await;
        assert!(matches!(events.last(), Some(ModelEvent::Cancelled)));
    }

    #[tokio::test]
    async fn invoke_dispatches_on_mode() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .text("whole")
                .stream(vec![Piece::text("part"), Piece::Done]),
        );
        let invoker = invoker(&provider, 1);
        let cancel = CancellationToken::new();
        assert!(matches!(
            invoker.invoke(request(), false, &cancel).await.unwrap(),
            ModelResponse::Complete(c) if c.text == "whole"
        ));
        let ModelResponse::Streaming(mut stream) = invoker.invoke(request(), true, &cancel).await.unwrap() else {
            panic!("expected a stream");
        };
        assert!(!stream.invocation_id().is_empty());
        assert!(matches!(stream.recv().await, Some(ModelEvent::Delta(t)) if t == "part"));
    }
}
