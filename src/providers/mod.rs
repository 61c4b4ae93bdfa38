// src/providers/mod.rs
// Provider capability trait and the process-global provider map

pub mod openai_compat;
pub mod scripted;

pub use openai_compat::OpenAiCompatProvider;
pub use scripted::ScriptedProvider;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::ProviderStreamError;

/// One increment of a provider's streamed response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    ThoughtsStart,
    Thoughts { content: String },
    AnswerStart,
    Answer { content: String },
    Usage { usage: Value },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Everything a provider needs to stream one turn.
#[derive(Debug, Clone, Default)]
pub struct ChatStreamRequest {
    pub message: String,
    pub model: String,
    pub include_thoughts: bool,
    pub system_prompt: Option<String>,
    pub chat_history: Vec<HistoryMessage>,
    pub file_attachments: Vec<String>,
}

pub type ProviderStream =
    Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderStreamError>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub supports_reasoning: bool,
}

/// Universal provider interface. Instances are process-global and must be
/// internally synchronized.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for logging and registry keys.
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn available_models(&self) -> Vec<ModelInfo>;

    fn supports_reasoning(&self, model: &str) -> bool;

    /// Native token counter, when the provider exposes one. `None` sends
    /// the caller to the character-ratio fallback.
    fn count_tokens(&self, _text: &str, _model: &str) -> Option<i64> {
        None
    }

    /// Open a streaming generation. Chunk ordering contract:
    /// `thoughts_start` precedes any `thoughts`, `answer_start` precedes
    /// any `answer`, `usage` may arrive at any point near the end.
    async fn stream_chat(
        &self,
        request: ChatStreamRequest,
    ) -> Result<ProviderStream, ProviderStreamError>;
}

/// Registry of provider instances, constructed once at startup.
#[derive(Clone, Default)]
pub struct ProviderMap {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderMap {
    /// The standard map: OpenAI-compatible adapters keyed by provider
    /// name, enabled when their API key env var is present.
    pub fn standard() -> Self {
        let mut map = Self::default();
        map.register(Arc::new(OpenAiCompatProvider::openrouter()));
        map.register(Arc::new(OpenAiCompatProvider::groq()));
        map.register(Arc::new(OpenAiCompatProvider::cerebras()));
        map
    }

    pub fn register(&mut self, provider: Arc<dyn ChatProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn availability(&self) -> HashMap<String, bool> {
        self.providers
            .iter()
            .map(|(name, p)| (name.clone(), p.is_available()))
            .collect()
    }

    /// All models across available providers, keyed `provider:model`.
    pub fn all_models(&self) -> HashMap<String, ModelInfo> {
        let mut models = HashMap::new();
        for (name, provider) in &self.providers {
            if !provider.is_available() {
                continue;
            }
            for model in provider.available_models() {
                models.insert(format!("{name}:{}", model.id), model);
            }
        }
        models
    }

    /// Infer which provider serves a model id, preferring available ones.
    pub fn infer_provider_for_model(&self, model: &str) -> Option<String> {
        self.providers
            .iter()
            .filter(|(_, p)| p.is_available())
            .find(|(_, p)| p.available_models().iter().any(|m| m.id == model))
            .map(|(name, _)| name.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}
