// src/context/mod.rs
// Token estimation and provider usage extraction

use serde_json::Value;

use crate::providers::{ChatProvider, HistoryMessage};

/// Character-to-token ratio used when a provider has no native counter.
pub const FALLBACK_CHARS_PER_TOKEN: i64 = 4;

/// Provider-aware token accounting for rate-limit reservations.
pub struct ContextManager;

impl ContextManager {
    /// Estimate the token cost of one request: system prompt + history +
    /// current message. Uses the provider's native counter when exposed,
    /// otherwise the character-ratio fallback.
    pub fn estimate_request_tokens(
        provider: &dyn ChatProvider,
        model: &str,
        system_prompt: Option<&str>,
        chat_history: &[HistoryMessage],
        current_message: &str,
    ) -> i64 {
        let mut text = String::new();
        if let Some(system) = system_prompt {
            text.push_str(system);
            text.push('\n');
        }
        for message in chat_history {
            text.push_str(&message.content);
            text.push('\n');
        }
        text.push_str(current_message);

        match provider.count_tokens(&text, model) {
            Some(count) => count,
            None => estimate_by_chars(&text),
        }
    }

    /// Pull the total token count out of a provider usage blob. Handles
    /// the OpenAI-compatible shape (`total_tokens`), the Gemini shape
    /// (`total_token_count`), and falls back to summing input/output
    /// fields when no total is present.
    pub fn extract_actual_tokens(usage: &Value) -> i64 {
        if let Some(total) = usage
            .get("total_tokens")
            .or_else(|| usage.get("total_token_count"))
            .and_then(|v| v.as_i64())
        {
            return total;
        }

        let input = usage
            .get("prompt_tokens")
            .or_else(|| usage.get("input_tokens"))
            .or_else(|| usage.get("prompt_token_count"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let output = usage
            .get("completion_tokens")
            .or_else(|| usage.get("output_tokens"))
            .or_else(|| usage.get("candidates_token_count"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        input + output
    }
}

pub fn estimate_by_chars(text: &str) -> i64 {
    (text.len() as i64 / FALLBACK_CHARS_PER_TOKEN).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_openai_and_gemini_shapes() {
        assert_eq!(
            ContextManager::extract_actual_tokens(&json!({"total_tokens": 42})),
            42
        );
        assert_eq!(
            ContextManager::extract_actual_tokens(&json!({"total_token_count": 17})),
            17
        );
        assert_eq!(
            ContextManager::extract_actual_tokens(
                &json!({"prompt_tokens": 10, "completion_tokens": 5})
            ),
            15
        );
    }

    #[test]
    fn char_fallback_never_returns_zero() {
        assert_eq!(estimate_by_chars(""), 1);
        assert_eq!(estimate_by_chars("abcdefgh"), 2);
    }
}
