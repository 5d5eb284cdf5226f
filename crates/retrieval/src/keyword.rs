//! In-memory keyword index.
//!
//! Documents are split into paragraph chunks. A chunk's score is the share of
//! distinct query terms it contains, so scores fall in `0.0..=1.0` and a
//! chunk sharing no term with the query is never returned.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use mentorlink_core::error::RetrievalError;
use mentorlink_core::retrieval::{Fragment, RetrievalQuery, Retriever, rank_fragments};
use tokio::sync::RwLock;
use tracing::debug;

/// Chunks shorter than this are merged into the following paragraph.
const MIN_CHUNK_CHARS: usize = 200;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how", "i",
    "in", "is", "it", "of", "on", "or", "that", "the", "this", "to", "was", "what", "when", "where",
    "which", "who", "why", "with", "you",
];

#[derive(Debug, Clone)]
struct Chunk {
    id: String,
    source: String,
    text: String,
    terms: HashSet<String>,
}

/// A keyword index held in memory.
#[derive(Default)]
pub struct KeywordIndex {
    chunks: Arc<RwLock<Vec<Chunk>>>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a document. Returns the number of chunks it produced.
    pub async fn add_document(&self, source: &str, text: &str) -> usize {
        let mut chunks = self.chunks.write().await;
        let pieces = split_paragraphs(text);
        let count = pieces.len();
        for (n, piece) in pieces.into_iter().enumerate() {
            chunks.push(Chunk {
                id: format!("{source}#{n}"),
                source: source.to_string(),
                terms: terms(&piece),
                text: piece,
            });
        }
        debug!(source, chunks = count, "Indexed document");
        count
    }

    /// Index every `.md` and `.txt` file directly inside `dir`.
    ///
    /// Returns the number of documents indexed.
    pub async fn load_dir(&self, dir: impl AsRef<Path>) -> std::io::Result<usize> {
        let mut entries = tokio::fs::read_dir(dir.as_ref()).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_doc = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("txt"));
            if is_doc && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        for path in &paths {
            let text = tokio::fs::read_to_string(path).await?;
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            self.add_document(&source, &text).await;
        }
        Ok(paths.len())
    }

    pub async fn len(&self) -> usize {
        self.chunks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.read().await.is_empty()
    }
}

/// Split on blank lines, merging short paragraphs forward.
fn split_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(para);
        if current.len() >= MIN_CHUNK_CHARS {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Lowercased alphanumeric terms, minus stopwords and single characters.
fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 1)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

#[async_trait]
impl Retriever for KeywordIndex {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn retrieve(&self, query: &RetrievalQuery) -> Result<Vec<Fragment>, RetrievalError> {
        let query_terms = terms(&query.text);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = self.chunks.read().await;
        let candidates = chunks
            .iter()
            .filter_map(|chunk| {
                let hits = query_terms.intersection(&chunk.terms).count();
                (hits > 0).then(|| Fragment {
                    id: chunk.id.clone(),
                    source: chunk.source.clone(),
                    text: chunk.text.clone(),
                    score: hits as f32 / query_terms.len() as f32,
                })
            })
            .collect();

        Ok(rank_fragments(candidates, query))
    }
}
