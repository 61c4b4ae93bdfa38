// src/providers/scripted.rs
// Deterministic provider used by integration tests and local smoke runs

use async_stream::stream;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{ChatProvider, ChatStreamRequest, ModelInfo, ProviderStream, StreamChunk};
use crate::error::ProviderStreamError;

pub type ScriptedAttempt = Vec<Result<StreamChunk, ProviderStreamError>>;

/// Replays pre-scripted attempts, one per `stream_chat` call. When the
/// script runs out the last attempt repeats, so retry loops terminate.
pub struct ScriptedProvider {
    name: &'static str,
    attempts: Mutex<VecDeque<ScriptedAttempt>>,
    last_attempt: Mutex<ScriptedAttempt>,
    chunk_delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    pub fn new(name: &'static str, attempts: Vec<ScriptedAttempt>) -> Self {
        let last = attempts.last().cloned().unwrap_or_default();
        Self {
            name,
            attempts: Mutex::new(attempts.into()),
            last_attempt: Mutex::new(last),
            chunk_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Single successful attempt streaming `text` split into whitespace
    /// chunks, followed by a usage record.
    pub fn answering(name: &'static str, text: &str, total_tokens: i64) -> Self {
        let mut attempt: ScriptedAttempt = vec![Ok(StreamChunk::AnswerStart)];
        for word in text.split_inclusive(' ') {
            attempt.push(Ok(StreamChunk::Answer {
                content: word.to_string(),
            }));
        }
        attempt.push(Ok(StreamChunk::Usage {
            usage: serde_json::json!({"total_tokens": total_tokens}),
        }));
        Self::new(name, vec![attempt])
    }

    /// Fail with retryable stream errors for `failures` attempts, then
    /// stream `text`.
    pub fn failing_then_answering(name: &'static str, failures: usize, text: &str) -> Self {
        let mut attempts: Vec<ScriptedAttempt> = Vec::new();
        for i in 0..failures {
            attempts.push(vec![Err(ProviderStreamError::Interrupted(format!(
                "scripted failure {}",
                i + 1
            )))]);
        }
        let mut success: ScriptedAttempt = vec![Ok(StreamChunk::AnswerStart)];
        success.push(Ok(StreamChunk::Answer {
            content: text.to_string(),
        }));
        attempts.push(success);
        Self::new(name, attempts)
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_available(&self) -> bool {
        true
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        vec![ModelInfo {
            id: "scripted-model".to_string(),
            display_name: "Scripted".to_string(),
            supports_reasoning: true,
        }]
    }

    fn supports_reasoning(&self, _model: &str) -> bool {
        true
    }

    fn count_tokens(&self, text: &str, _model: &str) -> Option<i64> {
        Some((text.len() as i64 / 4).max(1))
    }

    async fn stream_chat(
        &self,
        _request: ChatStreamRequest,
    ) -> Result<ProviderStream, ProviderStreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let attempt = {
            let mut attempts = self.attempts.lock();
            match attempts.pop_front() {
                Some(attempt) => attempt,
                None => self.last_attempt.lock().clone(),
            }
        };
        let delay = self.chunk_delay;

        let stream = stream! {
            for item in attempt {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield item;
            }
        };
        Ok(Box::pin(stream))
    }
}
