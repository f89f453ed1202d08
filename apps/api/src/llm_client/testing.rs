//! Scripted [`ModelProvider`] for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{CompletionRequest, LlmError, ModelProvider};

type CompleteFn = Box<dyn Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync>;
type EmbedFn = Box<dyn Fn(&[String]) -> Result<Vec<Vec<f32>>, LlmError> + Send + Sync>;

pub struct FakeProvider {
    complete: CompleteFn,
    embed: EmbedFn,
    delay: Duration,
    pub complete_calls: AtomicUsize,
    pub embed_calls: AtomicUsize,
}

impl FakeProvider {
    /// Completions fail with a 500; embeddings are `[chars, 1.0]` per input.
    pub fn new() -> Self {
        Self {
            complete: Box::new(|_| {
                Err(LlmError::Server {
                    status: 500,
                    message: "scripted failure".into(),
                })
            }),
            embed: Box::new(|inputs| {
                Ok(inputs
                    .iter()
                    .map(|t| vec![t.chars().count() as f32, 1.0])
                    .collect())
            }),
            delay: Duration::ZERO,
            complete_calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_complete(
        mut self,
        f: impl Fn(&CompletionRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.complete = Box::new(f);
        self
    }

    pub fn with_embed(
        mut self,
        f: impl Fn(&[String]) -> Result<Vec<Vec<f32>>, LlmError> + Send + Sync + 'static,
    ) -> Self {
        self.embed = Box::new(f);
        self
    }

    /// Every call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn completions(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn embeddings(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for FakeProvider {
    fn provider_name(&self) -> &str {
        "fake"
    }

    fn chat_model(&self) -> &str {
        "fake-chat"
    }

    fn embedding_model(&self) -> &str {
        "fake-embed"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.complete)(&request)
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.embed)(inputs)
    }
}
