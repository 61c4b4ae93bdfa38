// src/versioning/mod.rs
// Branch tree over chats: edit/retry/delete operations fork a version
// chat and record per-message variants

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::store::{message_position, ChatRecord, ChatStore, MessageRecord, SaveMessage};

#[derive(Debug, Clone, Deserialize)]
pub struct VersionOperationRequest {
    pub operation_type: String,
    pub message_id: String,
    pub chat_id: String,
    pub new_content: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionOperationResult {
    pub success: bool,
    pub version_chat_id: String,
    pub operation_type: String,
    pub original_chat_id: String,
    pub belongsto: String,
    pub operation_applied: bool,
    pub message_count: usize,
    pub needs_streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_message: Option<String>,
    pub attached_file_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageVersionEntry {
    pub version_number: i64,
    pub chat_version_id: String,
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageVersionsResponse {
    pub success: bool,
    pub message_id: String,
    pub versions: Vec<MessageVersionEntry>,
    pub active_version_number: i64,
}

pub struct VersioningService {
    store: ChatStore,
}

impl VersioningService {
    pub fn new(store: ChatStore) -> Self {
        Self { store }
    }

    /// Fork the chat with the requested operation applied. The new chat
    /// carries `isversion=true` and `belongsto=source`, and variant rows
    /// land in `message_versions` keyed by the family's root chat.
    pub async fn apply_operation(
        &self,
        request: &VersionOperationRequest,
    ) -> anyhow::Result<VersionOperationResult> {
        let operation = request.operation_type.as_str();
        if !matches!(operation, "edit" | "retry" | "delete") {
            anyhow::bail!("unsupported operation_type: {operation}");
        }
        if operation == "edit" && request.new_content.is_none() {
            anyhow::bail!("edit requires new_content in payload");
        }
        if !self.store.chat_exists(&request.chat_id).await? {
            anyhow::bail!("source chat {} not found", request.chat_id);
        }

        let chat_history = self.store.get_chat_history(&request.chat_id).await?;
        let source_chat = self
            .store
            .get_chat(&request.chat_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("source chat metadata not found"))?;

        // Locate the target message by its positional suffix
        let position = message_position(&request.message_id)
            .ok_or_else(|| anyhow::anyhow!("invalid message id: {}", request.message_id))?;
        let mut target_index = (position as usize)
            .checked_sub(1)
            .filter(|idx| *idx < chat_history.len())
            .ok_or_else(|| {
                anyhow::anyhow!("could not find target message {}", request.message_id)
            })?;

        // A retry of an assistant turn means "retry the user message
        // that produced it"
        let mut requested_assistant_index = None;
        if operation == "retry" && chat_history[target_index].role == "assistant" {
            requested_assistant_index = Some(target_index);
            target_index = chat_history[..target_index]
                .iter()
                .rposition(|m| m.role == "user")
                .unwrap_or(target_index);
        }
        let target_message = chat_history[target_index].clone();

        let version_chat_id = self
            .create_version_chat(&request.chat_id, operation, &source_chat)
            .await?;

        // Which prefix of the transcript survives into the branch
        let (messages_to_copy, needs_streaming, stream_message) = match operation {
            "delete" => (chat_history[..target_index].to_vec(), false, None),
            "retry" => (
                chat_history[..=target_index].to_vec(),
                true,
                Some(target_message.content.clone()),
            ),
            _ => {
                // edit
                if target_message.role == "user" {
                    let mut copied = chat_history[..target_index].to_vec();
                    let mut edited = target_message.clone();
                    edited.content = request.new_content.clone().unwrap_or_default();
                    copied.push(edited);
                    (copied, true, request.new_content.clone())
                } else {
                    let mut copied = chat_history.clone();
                    copied[target_index].content =
                        request.new_content.clone().unwrap_or_default();
                    (copied, false, None)
                }
            }
        };

        let new_message_ids = self
            .copy_messages_to_version(&version_chat_id, &messages_to_copy)
            .await?;

        if matches!(operation, "edit" | "retry") {
            self.record_versions_and_lineage(
                request,
                &version_chat_id,
                target_index,
                &target_message,
                requested_assistant_index,
                &chat_history,
                &new_message_ids,
            )
            .await;
        }

        info!(
            version_chat_id = %version_chat_id,
            operation = %operation,
            copied = messages_to_copy.len(),
            source_len = chat_history.len(),
            "Created version chat"
        );

        // Attachments that should ride along with the regenerated turn
        let mut attached_file_ids = Vec::new();
        if needs_streaming {
            let stream_target = format!("{version_chat_id}_{}", messages_to_copy.len());
            attached_file_ids = self
                .store
                .get_message_files(&stream_target)
                .await
                .map(|files| files.into_iter().map(|f| f.id).collect())
                .unwrap_or_default();
        }

        let target_message_id = (operation != "delete" && !messages_to_copy.is_empty())
            .then(|| format!("{version_chat_id}_{}", messages_to_copy.len()));

        Ok(VersionOperationResult {
            success: true,
            version_chat_id,
            operation_type: operation.to_string(),
            original_chat_id: request.chat_id.clone(),
            belongsto: request.chat_id.clone(),
            operation_applied: true,
            message_count: messages_to_copy.len(),
            needs_streaming,
            stream_message,
            attached_file_ids,
            target_message_id,
        })
    }

    /// `"{op}_{n+1}"` where n is the highest existing sibling number for
    /// that operation under the same source chat.
    async fn create_version_chat(
        &self,
        source_chat_id: &str,
        operation: &str,
        source_chat: &ChatRecord,
    ) -> anyhow::Result<String> {
        let all_chats = self.store.get_all_chats().await?;
        let prefix = format!("{operation}_");
        let highest = all_chats
            .iter()
            .filter(|c| c.belongsto.as_deref() == Some(source_chat_id))
            .filter_map(|c| c.name.as_deref())
            .filter_map(|name| name.strip_prefix(&prefix))
            .filter_map(|n| n.parse::<u32>().ok())
            .max()
            .unwrap_or(0);
        let version_name = format!("{operation}_{}", highest + 1);

        let version_chat_id = format!(
            "version_{}_{}",
            chrono::Utc::now().timestamp(),
            rand::thread_rng().gen_range(10_000..100_000)
        );

        let created = self
            .store
            .create_chat_full(
                &version_chat_id,
                source_chat.system_prompt.as_deref(),
                Some(&version_name),
                true,
                Some(source_chat_id),
            )
            .await?;
        if !created {
            anyhow::bail!("failed to create version chat");
        }
        Ok(version_chat_id)
    }

    async fn copy_messages_to_version(
        &self,
        version_chat_id: &str,
        messages: &[MessageRecord],
    ) -> anyhow::Result<Vec<String>> {
        let mut new_ids = Vec::with_capacity(messages.len());
        for message in messages {
            let attached_file_ids = self
                .store
                .get_message_files(&message.id)
                .await
                .map(|files| files.into_iter().map(|f| f.id).collect())
                .unwrap_or_default();

            let new_id = self
                .store
                .save_message(
                    version_chat_id,
                    SaveMessage {
                        role: message.role.clone(),
                        content: message.content.clone(),
                        thoughts: message.thoughts.clone(),
                        provider: message.provider.clone(),
                        model: message.model.clone(),
                        attached_file_ids,
                        router_enabled: message.router_enabled,
                        router_decision: message.router_decision.clone(),
                    },
                )
                .await?;
            debug!(new_id = %new_id, "Copied message into version chat");
            new_ids.push(new_id);
        }
        Ok(new_ids)
    }

    /// Version bookkeeping for edit/retry: the original row is recorded
    /// lazily, the new variant appended, and lineage links the copied
    /// turn back to its source message.
    #[allow(clippy::too_many_arguments)]
    async fn record_versions_and_lineage(
        &self,
        request: &VersionOperationRequest,
        version_chat_id: &str,
        target_index: usize,
        target_message: &MessageRecord,
        requested_assistant_index: Option<usize>,
        chat_history: &[MessageRecord],
        new_message_ids: &[String],
    ) {
        let operation = request.operation_type.as_str();
        let main_chat_id = self
            .store
            .find_main_chat(&request.chat_id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| request.chat_id.clone());
        let original_msg_id = format!("{main_chat_id}_{}", target_index + 1);

        let existing = self
            .store
            .get_message_versions(&original_msg_id)
            .await
            .unwrap_or_default();
        if existing.is_empty() {
            if let Err(e) = self
                .store
                .record_message_version(
                    &original_msg_id,
                    &request.chat_id,
                    "original",
                    &target_message.content,
                )
                .await
            {
                warn!("Could not record original message version: {}", e);
            }
        }

        let new_content = if operation == "edit" {
            request.new_content.as_deref().unwrap_or_default()
        } else {
            &target_message.content
        };
        if let Err(e) = self
            .store
            .record_message_version(&original_msg_id, version_chat_id, operation, new_content)
            .await
        {
            warn!("Could not record message version: {}", e);
        }

        // A retry initiated from an assistant message also versions that
        // assistant slot so the UI can page through responses
        if let Some(assistant_index) = requested_assistant_index {
            if let Some(assistant_message) = chat_history.get(assistant_index) {
                let assistant_group_id = format!("{main_chat_id}_{}", assistant_index + 1);
                let assistant_existing = self
                    .store
                    .get_message_versions(&assistant_group_id)
                    .await
                    .unwrap_or_default();
                if assistant_existing.is_empty() {
                    let _ = self
                        .store
                        .record_message_version(
                            &assistant_group_id,
                            &request.chat_id,
                            "original",
                            &assistant_message.content,
                        )
                        .await;
                }
                let _ = self
                    .store
                    .record_message_version(
                        &assistant_group_id,
                        version_chat_id,
                        "retry",
                        &assistant_message.content,
                    )
                    .await;
            }
        }

        // Lineage for the turn that will regenerate in the branch
        if target_message.role == "user" || operation == "retry" {
            let new_user_id = new_message_ids
                .last()
                .cloned()
                .unwrap_or_else(|| format!("{version_chat_id}_{}", new_message_ids.len()));
            let parent_id = format!("{}_{}", request.chat_id, target_index + 1);
            if let Err(e) = self
                .store
                .record_lineage(&new_user_id, "user", Some(&parent_id))
                .await
            {
                warn!("Failed to record user lineage: {}", e);
            }
        }
        if target_message.role == "assistant" && operation == "edit" {
            if let Some(new_assistant_id) = new_message_ids.get(target_index) {
                let parent_id = format!("{}_{}", request.chat_id, target_index + 1);
                if let Err(e) = self
                    .store
                    .record_lineage(new_assistant_id, "assistant", Some(&parent_id))
                    .await
                {
                    warn!("Failed to record assistant lineage: {}", e);
                }
            }
        }

        // Earlier copies are plain history, not variants
        for new_id in new_message_ids.iter().take(target_index) {
            if let Err(e) = self.store.delete_lineage(new_id).await {
                warn!("Lineage cleanup failed for {}: {}", new_id, e);
            }
        }
    }

    /// Versions of the message slot `message_id` occupies within its
    /// branch family: lineage first, then the version table, then
    /// synthesized from the tree.
    pub async fn get_message_versions(
        &self,
        message_id: &str,
    ) -> anyhow::Result<MessageVersionsResponse> {
        let position = message_position(message_id)
            .ok_or_else(|| anyhow::anyhow!("invalid message id: {message_id}"))?;
        let base_chat_id = message_id
            .rsplit_once('_')
            .map(|(chat, _)| chat.to_string())
            .unwrap_or_default();
        let main_chat_id = self
            .store
            .find_main_chat(&base_chat_id)
            .await?
            .unwrap_or_else(|| base_chat_id.clone());
        let group_msg_id = format!("{main_chat_id}_{position}");

        let lineage_versions = self.store.get_lineage_versions(message_id).await?;
        let rows = if !lineage_versions.is_empty() {
            lineage_versions
        } else {
            let mut rows = self.store.get_message_versions(&group_msg_id).await?;
            if rows.is_empty() && position > 1 {
                // Assistant slots share the version group of the user
                // turn that produced them
                let is_assistant = self
                    .store
                    .get_message(message_id)
                    .await?
                    .map(|m| m.role == "assistant")
                    .unwrap_or(false);
                if is_assistant {
                    rows = self
                        .store
                        .get_message_versions(&format!("{main_chat_id}_{}", position - 1))
                        .await?;
                }
            }
            rows
        };

        let mut versions: Vec<MessageVersionEntry> = rows
            .iter()
            .filter(|row| matches!(row.operation.as_str(), "original" | "edit" | "retry"))
            .map(|row| MessageVersionEntry {
                version_number: row.version_number,
                chat_version_id: row.chat_version_id.clone(),
                operation: row.operation.clone(),
                content: Some(row.content.clone()),
                created_at: Some(row.created_at),
            })
            .collect();

        if versions.is_empty() {
            versions = self
                .synthesize_versions(&main_chat_id, position as usize)
                .await
                .unwrap_or_default();
        }

        let active_version_number = versions
            .iter()
            .filter(|v| v.chat_version_id == base_chat_id)
            .map(|v| v.version_number)
            .max()
            .or_else(|| versions.iter().map(|v| v.version_number).max())
            .unwrap_or(1);

        Ok(MessageVersionsResponse {
            success: true,
            message_id: message_id.to_string(),
            versions,
            active_version_number,
        })
    }

    /// With no recorded versions, walk the branch tree and pick the
    /// message at this position from every family member: main chat
    /// first, then children by creation time.
    async fn synthesize_versions(
        &self,
        main_chat_id: &str,
        position: usize,
    ) -> anyhow::Result<Vec<MessageVersionEntry>> {
        let all_chats = self.store.get_all_chats().await?;
        let mut family = Vec::new();
        for chat in &all_chats {
            if chat.id == main_chat_id {
                family.push(chat.clone());
                continue;
            }
            if chat.isversion
                && self
                    .store
                    .find_main_chat(&chat.id)
                    .await
                    .ok()
                    .flatten()
                    .as_deref()
                    == Some(main_chat_id)
            {
                family.push(chat.clone());
            }
        }
        family.sort_by_key(|c| (c.id != main_chat_id, c.created_at));

        let mut entries = Vec::new();
        for chat in family {
            let Ok(history) = self.store.get_chat_history(&chat.id).await else {
                continue;
            };
            let Some(message) = history.get(position.saturating_sub(1)) else {
                continue;
            };
            if message.role != "user" {
                continue;
            }
            let operation = if chat.id == main_chat_id {
                "original".to_string()
            } else {
                let name = chat.name.clone().unwrap_or_default();
                if name.starts_with("edit_") {
                    "edit".to_string()
                } else {
                    "retry".to_string()
                }
            };
            entries.push(MessageVersionEntry {
                version_number: 0,
                chat_version_id: chat.id.clone(),
                operation,
                content: Some(message.content.clone()),
                created_at: Some(chat.created_at),
            });
        }

        for (index, entry) in entries.iter_mut().enumerate() {
            entry.version_number = index as i64 + 1;
        }
        Ok(entries)
    }

    /// Nested `belongsto` tree for the whole family, with the requesting
    /// chat marked active.
    pub async fn get_chat_versions(&self, chat_id: &str) -> anyhow::Result<Value> {
        let main_chat_id = self
            .store
            .find_main_chat(chat_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("could not find main chat for {chat_id}"))?;
        let all_chats = self.store.get_all_chats().await?;

        let main_chat = all_chats
            .iter()
            .find(|c| c.id == main_chat_id)
            .ok_or_else(|| anyhow::anyhow!("main chat {main_chat_id} not found"))?;

        let mut family = Vec::new();
        for chat in &all_chats {
            if chat.isversion
                && self
                    .store
                    .find_main_chat(&chat.id)
                    .await
                    .ok()
                    .flatten()
                    .as_deref()
                    == Some(main_chat_id.as_str())
            {
                family.push(chat.clone());
            }
        }

        fn build_children(
            parent_id: &str,
            family: &[ChatRecord],
            active_chat_id: &str,
        ) -> Vec<Value> {
            let mut children: Vec<&ChatRecord> = family
                .iter()
                .filter(|c| c.belongsto.as_deref() == Some(parent_id))
                .collect();
            children.sort_by_key(|c| c.created_at);

            children
                .into_iter()
                .map(|child| {
                    json!({
                        "id": child.id,
                        "name": child.name.clone().unwrap_or_else(|| "New Chat".to_string()),
                        "isversion": true,
                        "belongsto": child.belongsto,
                        "created_at": child.created_at,
                        "is_active": child.id == active_chat_id,
                        "children": build_children(&child.id, family, active_chat_id),
                    })
                })
                .collect()
        }

        Ok(json!({
            "success": true,
            "current_chat_id": chat_id,
            "main_chat_id": main_chat_id,
            "version_tree": {
                "id": main_chat.id,
                "name": main_chat.name.clone().unwrap_or_else(|| "New Chat".to_string()),
                "isversion": false,
                "belongsto": Value::Null,
                "created_at": main_chat.created_at,
                "is_active": main_chat.id == chat_id,
                "children": build_children(&main_chat.id, &family, chat_id),
            },
        }))
    }
}
