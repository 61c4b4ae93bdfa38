// src/store/files.rs
// File records and message attachments

use chrono::Utc;
use tracing::warn;

use super::types::{FileRecord, FILE_API_STATES};
use super::ChatStore;
use crate::error::StoreError;

fn api_state_rank(state: &str) -> Option<usize> {
    FILE_API_STATES.iter().position(|s| *s == state)
}

impl ChatStore {
    pub async fn save_file_record(&self, record: &FileRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO files (id, original_name, stored_filename, file_size, api_state, provider, api_file_name, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                original_name = excluded.original_name,
                stored_filename = excluded.stored_filename,
                file_size = excluded.file_size
            "#,
        )
        .bind(&record.id)
        .bind(&record.original_name)
        .bind(&record.stored_filename)
        .bind(record.file_size)
        .bind(&record.api_state)
        .bind(&record.provider)
        .bind(&record.api_file_name)
        .bind(if record.created_at > 0 { record.created_at } else { Utc::now().timestamp() })
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_file_record(&self, file_id: &str) -> Result<Option<FileRecord>, StoreError> {
        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, original_name, stored_filename, file_size, api_state, provider, api_file_name, created_at
            FROM files WHERE id = ?
            "#,
        )
        .bind(file_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    /// Advance a file's remote-upload state. Transitions are monotone
    /// along `local -> processing_md -> uploading -> processing -> ready`;
    /// `error` is reachable from anywhere. Regressions are ignored with a
    /// warning rather than rejected, since uploads may be retried.
    pub async fn update_file_api_info(
        &self,
        file_id: &str,
        api_state: &str,
        provider: Option<&str>,
        api_file_name: Option<&str>,
    ) -> Result<(), StoreError> {
        let Some(record) = self.get_file_record(file_id).await? else {
            return Err(StoreError::MessageNotFound(file_id.to_string()));
        };

        if api_state != "error" {
            let (Some(from), Some(to)) = (api_state_rank(&record.api_state), api_state_rank(api_state))
            else {
                warn!(file_id = %file_id, state = %api_state, "Unknown file api_state");
                return Ok(());
            };
            if to < from {
                warn!(
                    file_id = %file_id,
                    from = %record.api_state,
                    to = %api_state,
                    "Ignoring backwards file state transition"
                );
                return Ok(());
            }
        }

        sqlx::query(
            r#"
            UPDATE files
            SET api_state = ?,
                provider = COALESCE(?, provider),
                api_file_name = COALESCE(?, api_file_name)
            WHERE id = ?
            "#,
        )
        .bind(api_state)
        .bind(provider)
        .bind(api_file_name)
        .bind(file_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_message_files(&self, message_id: &str) -> Result<Vec<FileRecord>, StoreError> {
        let records = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT f.id, f.original_name, f.stored_filename, f.file_size, f.api_state, f.provider, f.api_file_name, f.created_at
            FROM files f
            JOIN message_files mf ON mf.file_id = f.id
            WHERE mf.message_id = ?
            "#,
        )
        .bind(message_id)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// Resolve file ids to remote API handles usable with the given
    /// provider. Files that are not `ready` (or belong to another
    /// provider) are skipped with a warning; a missing file never fails
    /// the turn.
    pub async fn resolve_api_file_names(
        &self,
        file_ids: &[String],
        provider: &str,
        default_provider: &str,
    ) -> Result<Vec<String>, StoreError> {
        let mut names = Vec::new();
        for file_id in file_ids {
            match self.get_file_record(file_id).await? {
                Some(record) => {
                    let effective_provider =
                        record.provider.as_deref().unwrap_or(default_provider);
                    match (&record.api_file_name, record.api_state.as_str()) {
                        (Some(api_name), "ready") if effective_provider == provider => {
                            names.push(api_name.clone());
                        }
                        _ => {
                            warn!(
                                file_id = %file_id,
                                state = %record.api_state,
                                provider = %effective_provider,
                                wanted = %provider,
                                "Skipping file that is not ready for this provider"
                            );
                        }
                    }
                }
                None => warn!(file_id = %file_id, "Attached file not found"),
            }
        }
        Ok(names)
    }
}
