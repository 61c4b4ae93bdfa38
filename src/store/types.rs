// src/store/types.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of a chat. Transitions are validated by the store:
/// `static -> thinking -> responding -> static`, `static -> responding`,
/// and any state back to `static`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatState {
    Static,
    Thinking,
    Responding,
}

impl ChatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Static => "static",
            ChatState::Thinking => "thinking",
            ChatState::Responding => "responding",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "static" => Some(ChatState::Static),
            "thinking" => Some(ChatState::Thinking),
            "responding" => Some(ChatState::Responding),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: ChatState) -> bool {
        if next == ChatState::Static || *self == next {
            return true;
        }
        matches!(
            (*self, next),
            (ChatState::Static, ChatState::Thinking)
                | (ChatState::Static, ChatState::Responding)
                | (ChatState::Thinking, ChatState::Responding)
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub name: Option<String>,
    pub system_prompt: Option<String>,
    pub state: String,
    pub isversion: bool,
    pub belongsto: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub role: String,
    pub content: String,
    pub thoughts: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub router_enabled: bool,
    pub router_decision: Option<String>,
    pub domain_execution: Option<String>,
    pub timestamp: i64,
}

impl MessageRecord {
    /// Numeric ordinal parsed from the id suffix. Message ids are
    /// `"{chat_id}_{position}"`; every reader must order by this value,
    /// never by the id string itself.
    pub fn position(&self) -> Option<u32> {
        message_position(&self.id)
    }
}

pub fn message_position(message_id: &str) -> Option<u32> {
    message_id.rsplit('_').next()?.parse().ok()
}

/// Remote-upload lifecycle of an attached file. Monotone except `*->error`.
pub const FILE_API_STATES: [&str; 6] = [
    "local",
    "processing_md",
    "uploading",
    "processing",
    "ready",
    "error",
];

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub original_name: String,
    pub stored_filename: String,
    pub file_size: i64,
    pub api_state: String,
    pub provider: Option<String>,
    pub api_file_name: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MessageVersionRow {
    pub original_message_id: String,
    pub version_number: i64,
    pub chat_version_id: String,
    pub operation: String,
    pub content: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LineageRow {
    pub message_id: String,
    pub role: String,
    pub parent_message_id: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct TokenUsageRow {
    pub chat_id: String,
    pub message_id: Option<String>,
    pub role: String,
    pub provider: String,
    pub model: String,
    pub estimated_tokens: i64,
    pub actual_tokens: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_parses_numeric_suffix() {
        assert_eq!(message_position("abc_12"), Some(12));
        assert_eq!(message_position("version_17000_42_3"), Some(3));
        assert_eq!(message_position("nounderscore"), None);
    }

    #[test]
    fn transitions() {
        use ChatState::*;
        assert!(Static.can_transition_to(Thinking));
        assert!(Static.can_transition_to(Responding));
        assert!(Thinking.can_transition_to(Responding));
        assert!(Responding.can_transition_to(Static));
        assert!(Thinking.can_transition_to(Static));
        assert!(!Responding.can_transition_to(Thinking));
    }
}
