//! Stub collaborators shared by unit tests

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use verta_core::{Document, LlmClient, Prompt, ResponseSchema, Result, Retriever, VertaError};

/// Language model returning scripted replies and recording every prompt
pub struct StubLlm {
    replies: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    chunks: Vec<String>,
    fail: bool,
    pub prompts: Mutex<Vec<Prompt>>,
    schemas: Mutex<Vec<ResponseSchema>>,
    pub calls: AtomicUsize,
}

impl StubLlm {
    fn build(replies: &[&str], chunks: &[&str], fail: bool) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            chunks: chunks.iter().map(|c| c.to_string()).collect(),
            fail,
            prompts: Mutex::new(Vec::new()),
            schemas: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always answers `reply`; streams it as a single chunk
    pub fn replying(reply: &str) -> Arc<Self> {
        Self::build(&[reply], &[], false)
    }

    /// Answers each reply in turn, repeating the last one
    pub fn sequence(replies: &[&str]) -> Arc<Self> {
        Self::build(replies, &[], false)
    }

    /// Streams the given chunks; `generate` returns them joined
    pub fn streaming(chunks: &[&str]) -> Arc<Self> {
        let joined = chunks.concat();
        Self::build(&[joined.as_str()], chunks, false)
    }

    /// Every call fails with a provider error
    pub fn failing() -> Arc<Self> {
        Self::build(&[], &[], true)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// System and user text of the latest call
    pub fn last_prompt(&self) -> String {
        self.prompts
            .lock()
            .unwrap()
            .last()
            .map(Prompt::flatten)
            .unwrap_or_default()
    }

    pub fn last_system(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().and_then(|p| p.system.clone())
    }

    /// Schemas passed to structured calls, in call order
    pub fn schemas(&self) -> Vec<ResponseSchema> {
        self.schemas.lock().unwrap().clone()
    }

    fn next_reply(&self, prompt: &Prompt) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.clone());
        if self.fail {
            return Err(VertaError::ProviderError("stub provider down".to_string()));
        }

        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.replies.lock().unwrap().pop_front() {
            *last = next;
        }
        Ok(last.clone())
    }
}

#[async_trait]
impl LlmClient for StubLlm {
    async fn generate(&self, prompt: &Prompt) -> Result<String> {
        self.next_reply(prompt)
    }

    async fn generate_structured(&self, prompt: &Prompt, schema: &ResponseSchema) -> Result<String> {
        self.schemas.lock().unwrap().push(schema.clone());
        self.next_reply(prompt)
    }

    async fn generate_stream(&self, prompt: &Prompt) -> Result<BoxStream<'static, Result<String>>> {
        let reply = self.next_reply(prompt)?;
        let chunks = if self.chunks.is_empty() {
            vec![reply]
        } else {
            self.chunks.clone()
        };
        Ok(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    fn model(&self) -> &str {
        "stub"
    }
}

/// Retriever returning a fixed batch per call, in call order
pub struct StubRetriever {
    batches: Mutex<VecDeque<Vec<Document>>>,
    pub calls: AtomicUsize,
}

impl StubRetriever {
    pub fn new(batches: Vec<Vec<Document>>) -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(batches.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Retriever for StubRetriever {
    async fn similarity_search(&self, _query: &str, k: usize) -> Result<Vec<Document>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut batch = self.batches.lock().unwrap().pop_front().unwrap_or_default();
        batch.truncate(k);
        Ok(batch)
    }

    fn len(&self) -> usize {
        self.batches.lock().unwrap().iter().map(Vec::len).sum()
    }
}

/// `n` review documents named `review-00`, `review-01`, ...
pub fn numbered_reviews(n: usize) -> Vec<Document> {
    (0..n)
        .map(|i| Document::with_source(format!("review-{i:02}"), "Review"))
        .collect()
}
