// src/store/messages.rs
// Message persistence: positional ids, throttled updates, cascade deletes

use chrono::Utc;
use tracing::debug;

use super::types::{message_position, MessageRecord};
use super::ChatStore;
use crate::error::StoreError;

/// Parameters for persisting a new message.
#[derive(Debug, Clone, Default)]
pub struct SaveMessage {
    pub role: String,
    pub content: String,
    pub thoughts: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub attached_file_ids: Vec<String>,
    pub router_enabled: bool,
    pub router_decision: Option<String>,
}

impl SaveMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            ..Default::default()
        }
    }
}

impl ChatStore {
    /// Persist a message, assigning the next ordinal position atomically.
    /// Returns the new message id (`"{chat_id}_{position}"`).
    pub async fn save_message(
        &self,
        chat_id: &str,
        message: SaveMessage,
    ) -> Result<String, StoreError> {
        let mut tx = self.pool().begin().await?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_one(&mut *tx)
            .await?;
        let position = count + 1;
        let message_id = format!("{chat_id}_{position}");

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, chat_id, role, content, thoughts, provider, model,
                router_enabled, router_decision, timestamp
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message_id)
        .bind(chat_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.thoughts)
        .bind(&message.provider)
        .bind(&message.model)
        .bind(message.router_enabled)
        .bind(&message.router_decision)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        for file_id in &message.attached_file_ids {
            sqlx::query("INSERT OR IGNORE INTO message_files (message_id, file_id) VALUES (?, ?)")
                .bind(&message_id)
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(chat_id = %chat_id, message_id = %message_id, role = %message.role, "Saved message");
        Ok(message_id)
    }

    /// Update an in-flight assistant message. Idempotent for identical
    /// arguments; passing `None` leaves the stored field untouched.
    pub async fn update_message(
        &self,
        message_id: &str,
        content: &str,
        thoughts: Option<&str>,
        domain_execution: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE messages
            SET content = ?,
                thoughts = COALESCE(?, thoughts),
                domain_execution = COALESCE(?, domain_execution)
            WHERE id = ?
            "#,
        )
        .bind(content)
        .bind(thoughts)
        .bind(domain_execution)
        .bind(message_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>, StoreError> {
        let message = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, chat_id, role, content, thoughts, provider, model,
                   router_enabled, router_decision, domain_execution, timestamp
            FROM messages WHERE id = ?
            "#,
        )
        .bind(message_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(message)
    }

    /// Remove the target message and every later message in the same chat.
    /// Returns the number of rows removed.
    pub async fn cascade_delete_message(
        &self,
        message_id: &str,
        chat_id: &str,
    ) -> Result<u64, StoreError> {
        let position = message_position(message_id)
            .ok_or_else(|| StoreError::MalformedMessageId(message_id.to_string()))?;

        let history = self.get_chat_history(chat_id).await?;
        let doomed: Vec<String> = history
            .into_iter()
            .filter(|m| m.position().map(|p| p >= position).unwrap_or(false))
            .map(|m| m.id)
            .collect();

        let mut tx = self.pool().begin().await?;
        for id in &doomed {
            sqlx::query("DELETE FROM message_lineage WHERE message_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!(chat_id = %chat_id, from = %message_id, removed = doomed.len(), "Cascade delete");
        Ok(doomed.len() as u64)
    }

    /// Full chat transcript ordered by the numeric position parsed from
    /// each id. Sorting the id strings lexicographically puts `x_10`
    /// before `x_2`, so the sort key must be the parsed integer.
    pub async fn get_chat_history(&self, chat_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let mut messages = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, chat_id, role, content, thoughts, provider, model,
                   router_enabled, router_decision, domain_execution, timestamp
            FROM messages WHERE chat_id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_all(self.pool())
        .await?;

        messages.sort_by_key(|m| m.position().unwrap_or(u32::MAX));
        Ok(messages)
    }
}
