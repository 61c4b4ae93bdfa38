// src/store/versioning.rs
// Message versions and lineage tables

use chrono::Utc;

use super::types::{message_position, LineageRow, MessageVersionRow};
use super::ChatStore;
use crate::error::StoreError;

impl ChatStore {
    /// Record a message variant. Version numbers are dense per
    /// `original_message_id`; version 1 is always the `original` row,
    /// recorded lazily before the first branch.
    pub async fn record_message_version(
        &self,
        original_message_id: &str,
        chat_version_id: &str,
        operation: &str,
        content: &str,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool().begin().await?;

        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version_number) FROM message_versions WHERE original_message_id = ?",
        )
        .bind(original_message_id)
        .fetch_one(&mut *tx)
        .await?;
        let version_number = max.unwrap_or(0) + 1;

        sqlx::query(
            r#"
            INSERT INTO message_versions (original_message_id, version_number, chat_version_id, operation, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(original_message_id)
        .bind(version_number)
        .bind(chat_version_id)
        .bind(operation)
        .bind(content)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(version_number)
    }

    pub async fn get_message_versions(
        &self,
        original_message_id: &str,
    ) -> Result<Vec<MessageVersionRow>, StoreError> {
        let rows = sqlx::query_as::<_, MessageVersionRow>(
            r#"
            SELECT original_message_id, version_number, chat_version_id, operation, content, created_at
            FROM message_versions
            WHERE original_message_id = ?
            ORDER BY version_number
            "#,
        )
        .bind(original_message_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn record_lineage(
        &self,
        message_id: &str,
        role: &str,
        parent_message_id: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO message_lineage (message_id, role, parent_message_id, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET parent_message_id = excluded.parent_message_id
            "#,
        )
        .bind(message_id)
        .bind(role)
        .bind(parent_message_id)
        .bind(Utc::now().timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_lineage(&self, message_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_lineage WHERE message_id = ?")
            .bind(message_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn get_lineage(&self, message_id: &str) -> Result<Option<LineageRow>, StoreError> {
        let row = sqlx::query_as::<_, LineageRow>(
            "SELECT message_id, role, parent_message_id, created_at FROM message_lineage WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    /// On version chats, link a freshly created assistant row to the
    /// matching assistant in the parent branch so versions resolve
    /// across the whole family. No-op for main chats.
    pub async fn record_version_assistant_lineage(
        &self,
        chat_id: &str,
        assistant_message_id: &str,
    ) -> Result<(), StoreError> {
        if !chat_id.starts_with("version_") {
            return Ok(());
        }

        let Some(chat) = self.get_chat(chat_id).await? else {
            return Ok(());
        };
        let Some(parent_id) = chat.belongsto else {
            return Ok(());
        };

        let history = self.get_chat_history(chat_id).await?;
        let Some(last_user_idx) = history.iter().rposition(|m| m.role == "user") else {
            return Ok(());
        };
        let last_user_pos = last_user_idx + 1;

        let parent_history = self.get_chat_history(&parent_id).await?;
        let parent_assistant_id = parent_history
            .iter()
            .skip(last_user_pos)
            .find(|m| m.role == "assistant")
            .map(|m| m.id.clone());

        self.record_lineage(
            assistant_message_id,
            "assistant",
            parent_assistant_id.as_deref(),
        )
        .await
    }

    /// Resolve the version list for a message through its lineage chain:
    /// walk parent links to the root, then look up the version group keyed
    /// by the root main chat id and the root position. Empty when the
    /// message has no lineage record.
    pub async fn get_lineage_versions(
        &self,
        message_id: &str,
    ) -> Result<Vec<MessageVersionRow>, StoreError> {
        let Some(mut row) = self.get_lineage(message_id).await? else {
            return Ok(Vec::new());
        };

        let mut hops = 0usize;
        while let Some(parent_id) = row.parent_message_id.clone() {
            if hops >= 64 {
                break;
            }
            match self.get_lineage(&parent_id).await? {
                Some(parent_row) => {
                    row = parent_row;
                    hops += 1;
                }
                None => {
                    row.message_id = parent_id;
                    row.parent_message_id = None;
                }
            }
        }

        let Some(position) = message_position(&row.message_id) else {
            return Ok(Vec::new());
        };
        let root_chat = match row.message_id.rsplit_once('_') {
            Some((chat, _)) => chat.to_string(),
            None => return Ok(Vec::new()),
        };
        let main_chat = self
            .find_main_chat(&root_chat)
            .await?
            .unwrap_or(root_chat);

        self.get_message_versions(&format!("{main_chat}_{position}"))
            .await
    }
}
