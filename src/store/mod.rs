// src/store/mod.rs
// Durable chat store: chats, messages, files, lineage, token usage

mod files;
mod messages;
mod schema;
mod types;
mod versioning;

pub use messages::SaveMessage;
pub use types::{
    message_position, ChatRecord, ChatState, FileRecord, LineageRow, MessageRecord,
    MessageVersionRow, TokenUsageRow, FILE_API_STATES,
};

use chrono::Utc;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::StoreError;

/// SQLite-backed store. All writes serialize through SQLite's single
/// writer (WAL mode); readers see snapshot state.
#[derive(Clone)]
pub struct ChatStore {
    pool: SqlitePool,
    main_chat_cache: std::sync::Arc<Mutex<HashMap<String, String>>>,
}

impl ChatStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            main_chat_cache: std::sync::Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open (creating if necessary) the store at the given URL and run the
    /// schema bootstrap.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database exists per connection; keep exactly one
        // alive or every checkout would see a fresh empty schema
        let in_memory = database_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 8 })
            .idle_timeout(if in_memory { None } else { Some(std::time::Duration::from_secs(600)) })
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::new(pool);
        store.ensure_schema().await?;
        info!("Chat store ready at {}", database_url);
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        schema::ensure_schema(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // === Chats ===

    /// Create a chat. Returns false when it already exists.
    pub async fn create_chat(
        &self,
        chat_id: &str,
        system_prompt: Option<&str>,
    ) -> Result<bool, StoreError> {
        self.create_chat_full(chat_id, system_prompt, None, false, None)
            .await
    }

    pub async fn create_chat_full(
        &self,
        chat_id: &str,
        system_prompt: Option<&str>,
        name: Option<&str>,
        isversion: bool,
        belongsto: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO chats (id, name, system_prompt, state, isversion, belongsto, created_at)
            VALUES (?, ?, ?, 'static', ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(name)
        .bind(system_prompt)
        .bind(isversion)
        .bind(belongsto)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn chat_exists(&self, chat_id: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Option<ChatRecord>, StoreError> {
        let chat = sqlx::query_as::<_, ChatRecord>(
            "SELECT id, name, system_prompt, state, isversion, belongsto, created_at FROM chats WHERE id = ?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(chat)
    }

    pub async fn get_all_chats(&self) -> Result<Vec<ChatRecord>, StoreError> {
        let chats = sqlx::query_as::<_, ChatRecord>(
            "SELECT id, name, system_prompt, state, isversion, belongsto, created_at FROM chats ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(chats)
    }

    pub async fn get_chat_state(&self, chat_id: &str) -> Result<ChatState, StoreError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM chats WHERE id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        let state = state.ok_or_else(|| StoreError::ChatNotFound(chat_id.to_string()))?;
        Ok(ChatState::parse(&state).unwrap_or(ChatState::Static))
    }

    pub async fn get_chat_system_prompt(&self, chat_id: &str) -> Result<Option<String>, StoreError> {
        let prompt: Option<Option<String>> =
            sqlx::query_scalar("SELECT system_prompt FROM chats WHERE id = ?")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(prompt.flatten())
    }

    /// Validated chat state transition.
    pub async fn update_chat_state(
        &self,
        chat_id: &str,
        state: ChatState,
    ) -> Result<(), StoreError> {
        let current = self.get_chat_state(chat_id).await?;
        if !current.can_transition_to(state) {
            return Err(StoreError::IllegalTransition {
                chat_id: chat_id.to_string(),
                from: current.as_str().to_string(),
                to: state.as_str().to_string(),
            });
        }

        sqlx::query("UPDATE chats SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        debug!(chat_id = %chat_id, state = state.as_str(), "Chat state updated");
        Ok(())
    }

    /// Delete a chat, cascading to messages, attachments and lineage.
    pub async fn delete_chat(&self, chat_id: &str) -> Result<bool, StoreError> {
        sqlx::query(
            "DELETE FROM message_lineage WHERE message_id IN (SELECT id FROM messages WHERE chat_id = ?)",
        )
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        let result = sqlx::query("DELETE FROM chats WHERE id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        self.main_chat_cache.lock().remove(chat_id);
        Ok(result.rows_affected() > 0)
    }

    /// Resolve the root main chat of a version family by walking
    /// `belongsto` links. Results are cached; the tree is never mutated
    /// once a branch exists.
    pub async fn find_main_chat(&self, chat_id: &str) -> Result<Option<String>, StoreError> {
        if let Some(cached) = self.main_chat_cache.lock().get(chat_id) {
            return Ok(Some(cached.clone()));
        }

        let mut current = chat_id.to_string();
        let mut hops = 0usize;
        loop {
            let Some(chat) = self.get_chat(&current).await? else {
                return Ok(None);
            };
            match chat.belongsto {
                Some(parent) if hops < 64 => {
                    current = parent;
                    hops += 1;
                }
                Some(_) => return Ok(None),
                None => break,
            }
        }

        self.main_chat_cache
            .lock()
            .insert(chat_id.to_string(), current.clone());
        Ok(Some(current))
    }

    // === Token usage ===

    #[allow(clippy::too_many_arguments)]
    pub async fn save_token_usage(
        &self,
        chat_id: &str,
        message_id: Option<&str>,
        role: &str,
        provider: &str,
        model: &str,
        estimated_tokens: i64,
        actual_tokens: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO token_usage (chat_id, message_id, role, provider, model, estimated_tokens, actual_tokens, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chat_id)
        .bind(message_id)
        .bind(role)
        .bind(provider)
        .bind(model)
        .bind(estimated_tokens)
        .bind(actual_tokens)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_token_usage(&self, chat_id: &str) -> Result<Vec<TokenUsageRow>, StoreError> {
        let rows = sqlx::query_as::<_, TokenUsageRow>(
            r#"
            SELECT chat_id, message_id, role, provider, model, estimated_tokens, actual_tokens, created_at
            FROM token_usage WHERE chat_id = ? ORDER BY id
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // === Coder workspaces ===

    pub async fn set_coder_workspace(
        &self,
        chat_id: &str,
        workspace_path: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO coder_workspaces (chat_id, workspace_path, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET workspace_path = excluded.workspace_path
            "#,
        )
        .bind(chat_id)
        .bind(workspace_path)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_coder_workspace(&self, chat_id: &str) -> Result<Option<String>, StoreError> {
        let path: Option<String> =
            sqlx::query_scalar("SELECT workspace_path FROM coder_workspaces WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(path)
    }
}
