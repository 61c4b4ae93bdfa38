// src/providers/openai_compat.rs
// Streaming adapter for OpenAI-compatible chat completion APIs

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ChatProvider, ChatStreamRequest, ModelInfo, ProviderStream, StreamChunk};
use crate::error::ProviderStreamError;

/// Thin adapter over `POST /chat/completions` with `stream: true`.
/// Covers OpenRouter, Groq and Cerebras, which share the wire format.
pub struct OpenAiCompatProvider {
    name: &'static str,
    base_url: String,
    api_key: Option<String>,
    models: Vec<ModelInfo>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: &'static str,
        base_url: impl Into<String>,
        api_key_env: &str,
        models: Vec<ModelInfo>,
    ) -> Self {
        Self {
            name,
            base_url: base_url.into(),
            api_key: std::env::var(api_key_env).ok().filter(|k| !k.is_empty()),
            models,
            client: reqwest::Client::new(),
        }
    }

    pub fn openrouter() -> Self {
        Self::new(
            "openrouter",
            "https://openrouter.ai/api/v1",
            "OPENROUTER_API_KEY",
            vec![
                model("google/gemini-2.5-flash", "Gemini 2.5 Flash", true),
                model("google/gemini-2.5-pro", "Gemini 2.5 Pro", true),
                model("moonshotai/kimi-k2", "Kimi K2", false),
            ],
        )
    }

    pub fn groq() -> Self {
        Self::new(
            "groq",
            "https://api.groq.com/openai/v1",
            "GROQ_API_KEY",
            vec![
                model("llama-3.3-70b-versatile", "Llama 3.3 70B", false),
                model("qwen/qwen3-32b", "Qwen3 32B", true),
            ],
        )
    }

    pub fn cerebras() -> Self {
        Self::new(
            "cerebras",
            "https://api.cerebras.ai/v1",
            "CEREBRAS_API_KEY",
            vec![model("llama-3.3-70b", "Llama 3.3 70B", false)],
        )
    }

    fn build_messages(&self, request: &ChatStreamRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.chat_history.len() + 2);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        for entry in &request.chat_history {
            // Tool transcripts are replayed as plain text turns
            let role = match entry.role.as_str() {
                "assistant" => "assistant",
                "system" => "system",
                _ => "user",
            };
            messages.push(json!({"role": role, "content": entry.content}));
        }
        messages.push(json!({"role": "user", "content": request.message}));
        messages
    }
}

/// Extract the payload of one `data:` SSE line, skipping the terminator.
fn sse_data(line: &str) -> Option<&str> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        self.models
            .iter()
            .any(|m| m.id == model && m.supports_reasoning)
    }

    async fn stream_chat(
        &self,
        request: ChatStreamRequest,
    ) -> Result<ProviderStream, ProviderStreamError> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ProviderStreamError::Fatal(format!("{} has no API key", self.name)))?;

        let body = json!({
            "model": request.model,
            "messages": self.build_messages(&request),
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderStreamError::Interrupted(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderStreamError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let include_thoughts = request.include_thoughts;
        let provider_name = self.name;
        let mut bytes = response.bytes_stream();

        let stream = try_stream! {
            let mut buffer = String::new();
            let mut answer_started = false;
            let mut thoughts_started = false;

            while let Some(part) = bytes.next().await {
                let part = part.map_err(|e| ProviderStreamError::Interrupted(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&part));

                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim_end_matches('\r').to_string();
                    buffer.drain(..=newline);

                    let Some(data) = sse_data(&line) else { continue };
                    let parsed: Value = match serde_json::from_str(data) {
                        Ok(value) => value,
                        Err(e) => {
                            debug!(provider = provider_name, "Skipping malformed SSE chunk: {}", e);
                            continue;
                        }
                    };

                    if let Some(usage) = parsed.get("usage").filter(|u| !u.is_null()) {
                        yield StreamChunk::Usage { usage: usage.clone() };
                    }

                    let Some(delta) = parsed.pointer("/choices/0/delta") else { continue };

                    if include_thoughts {
                        let reasoning = delta
                            .get("reasoning")
                            .or_else(|| delta.get("reasoning_content"))
                            .and_then(|v| v.as_str());
                        if let Some(text) = reasoning {
                            if !text.is_empty() {
                                if !thoughts_started {
                                    thoughts_started = true;
                                    yield StreamChunk::ThoughtsStart;
                                }
                                yield StreamChunk::Thoughts { content: text.to_string() };
                            }
                        }
                    }

                    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                        if !text.is_empty() {
                            if !answer_started {
                                answer_started = true;
                                yield StreamChunk::AnswerStart;
                            }
                            yield StreamChunk::Answer { content: text.to_string() };
                        }
                    }
                }
            }

            if !answer_started && !thoughts_started {
                warn!(provider = provider_name, "Stream ended without content");
            }
        };

        Ok(Box::pin(stream))
    }
}

fn model(id: &str, display_name: &str, supports_reasoning: bool) -> ModelInfo {
    ModelInfo {
        id: id.to_string(),
        display_name: display_name.to_string(),
        supports_reasoning,
    }
}
