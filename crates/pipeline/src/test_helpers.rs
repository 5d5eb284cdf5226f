//! Shared test helpers: a scripted provider and a retriever with canned
//! results.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mentorlink_core::error::{ProviderError, RetrievalError};
use mentorlink_core::provider::{ChunkReceiver, ModelRequest, Provider, ProviderResponse, StreamChunk, Usage};
use mentorlink_core::retrieval::{Fragment, RetrievalQuery, Retriever, rank_fragments};

/// One scripted reply to `complete()`.
pub enum Reply {
    Text(String),
    Error(ProviderError),
    /// Never answers.
    Hang,
}

/// One element of a scripted stream.
pub enum Piece {
    Text(String),
    Error(ProviderError),
    /// Stop sending and wait for the consumer to go away.
    Stall,
    /// Final chunk with usage.
    Done,
}

impl Piece {
    pub fn text(s: &str) -> Self {
        Piece::Text(s.to_string())
    }
}

/// A provider that plays back scripted replies in order.
///
/// `complete()` and `stream()` consume separate scripts. Both count toward
/// [`ScriptedProvider::calls`].
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    streams: Mutex<VecDeque<Result<Vec<Piece>, ProviderError>>>,
    requests: Mutex<Vec<ModelRequest>>,
    released: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_reply(self, reply: Reply) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn text(self, text: &str) -> Self {
        self.push_reply(Reply::Text(text.to_string()))
    }

    pub fn fail(self, error: ProviderError) -> Self {
        self.push_reply(Reply::Error(error))
    }

    pub fn hang(self) -> Self {
        self.push_reply(Reply::Hang)
    }

    pub fn stream(self, pieces: Vec<Piece>) -> Self {
        self.streams.lock().unwrap().push_back(Ok(pieces));
        self
    }

    /// The next `stream()` call fails to open.
    pub fn stream_fails(self, error: ProviderError) -> Self {
        self.streams.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Stalled streams whose consumer has gone away.
    pub fn released_streams(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ModelRequest) -> Result<ProviderResponse, ProviderError> {
        let model = request.model.clone();
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Text(content)) => Ok(ProviderResponse {
                content,
                usage: Some(usage()),
                model,
                metadata: serde_json::Map::new(),
            }),
            Some(Reply::Error(e)) => Err(e),
            Some(Reply::Hang) => std::future::pending().await,
            None => Err(ProviderError::NotConfigured("script exhausted".into())),
        }
    }

    async fn stream(&self, request: ModelRequest) -> Result<ChunkReceiver, ProviderError> {
        self.requests.lock().unwrap().push(request);
        let script = self.streams.lock().unwrap().pop_front();
        let pieces = match script {
            Some(Ok(pieces)) => pieces,
            Some(Err(e)) => return Err(e),
            None => return Err(ProviderError::NotConfigured("script exhausted".into())),
        };

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let released = self.released.clone();
        tokio::spawn(async move {
            for piece in pieces {
                let item = match piece {
                    Piece::Text(t) => Ok(StreamChunk {
                        content: Some(t),
                        ..Default::default()
                    }),
                    Piece::Error(e) => Err(e),
                    Piece::Done => Ok(StreamChunk {
                        content: None,
                        done: true,
                        usage: Some(usage()),
                    }),
                    Piece::Stall => {
                        tx.closed().await;
                        released.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                };
                let stop = item.is_err();
                if tx.send(item).await.is_err() || stop {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

/// A retriever with fixed results, an optional delay and an optional error.
pub struct StaticRetriever {
    fragments: Vec<Fragment>,
    delay: Option<Duration>,
    error: Option<RetrievalError>,
}

impl StaticRetriever {
    pub fn new(fragments: Vec<Fragment>) -> Self {
        Self {
            fragments,
            delay: None,
            error: None,
        }
    }

    pub fn failing(error: RetrievalError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(Vec::new())
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    fn name(&self) -> &str {
        "static"
    }

    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<Fragment>, RetrievalError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        Ok(rank_fragments(self.fragments.clone(), query))
    }
}

pub fn fragment(id: &str, text: &str, score: f32) -> Fragment {
    Fragment {
        id: id.to_string(),
        source: format!("{id}.md"),
        text: text.to_string(),
        score,
    }
}
