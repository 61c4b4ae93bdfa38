// src/engine/domain.rs
// Domain task execution: dispatching to the single-domain executor and
// translating its events onto the bus

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{AsyncEngine, DomainSession};
use crate::events::Event;
use crate::providers::HistoryMessage;
use crate::store::{ChatState, SaveMessage};

pub const WORKSPACE_PROMPT_MESSAGE: &str = "I need a workspace before I can start coding. \
     Please select a workspace in the Coder view to continue.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedFile {
    pub id: String,
    pub name: String,
}

/// Request handed to the single-domain executor.
#[derive(Debug, Clone, Default)]
pub struct DomainTaskRequest {
    pub domain_id: String,
    pub user_request: String,
    pub chat_id: String,
    pub chat_history: Vec<HistoryMessage>,
    pub attached_files: Vec<AttachedFile>,
    pub assistant_message_id: Option<String>,
    pub workspace_path: Option<String>,
}

/// A user's verdict on a tool call the domain paused for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDecisionRequest {
    pub chat_id: String,
    pub task_id: String,
    pub call_id: String,
    pub decision: String,
    pub assistant_message_id: Option<String>,
    pub batch_mode: bool,
    #[serde(default)]
    pub pre_executed_calls: HashMap<String, bool>,
    #[serde(default)]
    pub pre_execution_state: HashMap<String, Value>,
}

/// Low-level event surfaced by the executor while a task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Final state of a domain task. Unknown fields flow through `extra`
/// untouched for downstream consumers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainTaskResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DomainTaskResult {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: "completed".to_string(),
            output: Some(output.into()),
            ..Default::default()
        }
    }

    pub fn waiting_user(agent_message: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            status: "waiting_user".to_string(),
            agent_message: Some(agent_message.into()),
            task_id: Some(task_id.into()),
            ..Default::default()
        }
    }

    pub fn errored(error: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

pub type DomainEventCallback = Arc<dyn Fn(DomainEvent) + Send + Sync>;

/// Interface to the agent planners. Implementations run one task per
/// call and may pause awaiting a tool decision (`waiting_user`).
#[async_trait]
pub trait DomainExecutor: Send + Sync {
    async fn execute_domain_task(
        &self,
        request: DomainTaskRequest,
        events: DomainEventCallback,
    ) -> anyhow::Result<DomainTaskResult>;

    async fn handle_tool_decision(
        &self,
        decision: ToolDecisionRequest,
        events: DomainEventCallback,
    ) -> anyhow::Result<DomainTaskResult>;
}

/// Executor for deployments without agent support.
pub struct NullDomainExecutor;

#[async_trait]
impl DomainExecutor for NullDomainExecutor {
    async fn execute_domain_task(
        &self,
        request: DomainTaskRequest,
        _events: DomainEventCallback,
    ) -> anyhow::Result<DomainTaskResult> {
        Ok(DomainTaskResult::errored(format!(
            "domain '{}' has no registered executor",
            request.domain_id
        )))
    }

    async fn handle_tool_decision(
        &self,
        decision: ToolDecisionRequest,
        _events: DomainEventCallback,
    ) -> anyhow::Result<DomainTaskResult> {
        Ok(DomainTaskResult::errored(format!(
            "no executor to receive decision for task {}",
            decision.task_id
        )))
    }
}

/// Derive `coder_file_change` payloads from a tool-execution operation:
/// explicit workspace events in its metadata plus file ops in `ops`.
pub fn derive_file_change_events(operation: &Value) -> Vec<Value> {
    let mut events: Vec<Value> = Vec::new();

    if let Some(workspace_events) = operation
        .pointer("/metadata/workspace_events")
        .and_then(|v| v.as_array())
    {
        for raw in workspace_events {
            if raw.is_object() {
                events.push(raw.clone());
            }
        }
    }

    if let Some(ops) = operation.get("ops").and_then(|v| v.as_array()) {
        for op in ops {
            let op_type = op.get("type").and_then(|v| v.as_str());
            match op_type {
                Some("file_write") | Some("file_edit") => {
                    let path = op
                        .get("path")
                        .or_else(|| op.get("destination_path"))
                        .and_then(|v| v.as_str());
                    let Some(path) = path else { continue };
                    let operation_name = if op_type == Some("file_write") { "write" } else { "edit" };
                    events.push(json!({
                        "operation": operation_name,
                        "file_path": path,
                        "content": op.get("after").and_then(|v| v.as_str()),
                    }));
                }
                Some("file_move") => {
                    let dest = op
                        .get("destination_path")
                        .or_else(|| op.get("path"))
                        .and_then(|v| v.as_str());
                    let Some(dest) = dest else { continue };
                    events.push(json!({
                        "operation": "move",
                        "file_path": dest,
                        "previous_path": op.get("source_path"),
                    }));
                }
                _ => {}
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    events.retain(|event| {
        let key = (
            event.get("operation").cloned(),
            event.get("file_path").cloned(),
            event.get("previous_path").cloned(),
        );
        seen.insert(format!("{key:?}"))
    });
    events
}

/// Build the callback that maps executor events onto bus publishes.
pub fn domain_event_callback(
    engine: &Arc<AsyncEngine>,
    chat_id: &str,
    workspace_path: Option<String>,
) -> DomainEventCallback {
    let bus = engine.ctx().bus.clone();
    let chat_id = chat_id.to_string();

    Arc::new(move |event: DomainEvent| {
        let Some(payload) = event.payload.clone() else {
            return;
        };
        let task_id = event.task_id.clone();

        match event.event.as_str() {
            "state" => {
                bus.publish_event(
                    Event::content(&chat_id, "domain_execution_update", payload.to_string())
                        .with_meta("task_id", json!(task_id)),
                );
            }
            "model_retry" => {
                bus.publish_event(
                    Event::content(&chat_id, "model_retry", payload.to_string())
                        .with_meta("task_id", json!(task_id)),
                );
            }
            "tool_execution" => {
                let operation_payload = json!({
                    "task_id": task_id,
                    "domain_id": event.domain_id,
                    "operation": payload,
                    "workspace_path": workspace_path,
                });
                bus.publish_content(&chat_id, "coder_operation", &operation_payload.to_string());

                for raw_event in derive_file_change_events(&payload) {
                    let Some(file_path) = raw_event.get("file_path").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    let detail = json!({
                        "chat_id": chat_id,
                        "workspace_path": workspace_path,
                        "file_path": file_path,
                        "operation": raw_event.get("operation").and_then(|v| v.as_str()).unwrap_or("edit"),
                        "content": raw_event.get("content"),
                        "previous_path": raw_event.get("previous_path"),
                    });
                    bus.publish_content(&chat_id, "coder_file_change", &detail.to_string());
                }
            }
            "coder_stream" => {
                bus.publish_event(
                    Event::content(&chat_id, "coder_stream", payload.to_string())
                        .with_meta("task_id", json!(task_id)),
                );
            }
            "coder_file_operation" | "coder_file_revert" => {
                bus.publish_event(
                    Event::content(&chat_id, &event.event, "")
                        .with_meta("task_id", json!(task_id))
                        .with_meta("domain_id", json!(event.domain_id))
                        .with_meta("payload", payload),
                );
            }
            other => {
                warn!(chat_id = %chat_id, event = other, "Unknown domain event type");
            }
        }
    })
}

/// Persist and broadcast a domain result; returns the lowercase status.
pub async fn handle_domain_result(
    engine: &Arc<AsyncEngine>,
    chat_id: &str,
    result: &DomainTaskResult,
    assistant_message_id: Option<&str>,
    provider: &str,
    model: &str,
    workspace_path: Option<&str>,
) -> String {
    let ctx = engine.ctx();
    let status = result.status.to_lowercase();
    let domain_execution_json =
        serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string());

    info!(chat_id = %chat_id, status = %status, "Domain execution result");
    ctx.bus
        .publish_content(chat_id, "domain_execution", &domain_execution_json);

    let message_text = if let Some(error) = &result.error {
        format!("Domain execution error: {error}")
    } else if status == "waiting_user" {
        result.agent_message.clone().unwrap_or_default()
    } else if matches!(status.as_str(), "completed" | "failed" | "aborted") {
        result
            .output
            .clone()
            .or_else(|| result.agent_message.clone())
            .unwrap_or_default()
    } else {
        result.agent_message.clone().unwrap_or_default()
    };

    if !message_text.is_empty() {
        ctx.bus.publish_content(chat_id, "answer", &message_text);
    }

    if let Some(assistant_id) = assistant_message_id {
        let domain_json = if result.error.is_none() {
            Some(domain_execution_json.as_str())
        } else {
            None
        };
        if let Err(e) = ctx
            .store
            .update_message(assistant_id, &message_text, None, domain_json)
            .await
        {
            error!(chat_id = %chat_id, "Failed to persist domain result: {}", e);
        }
    }

    let set_static = |publish_complete: bool| {
        let engine = engine.clone();
        let chat_id = chat_id.to_string();
        async move {
            engine.set_chat_static(&chat_id).await;
            if publish_complete {
                engine.ctx().bus.publish_content(&chat_id, "complete", "");
            }
        }
    };

    if status == "waiting_user" {
        info!(chat_id = %chat_id, "Domain task waiting for user input, keeping session alive");
        set_static(false).await;
        engine.set_domain_session(
            chat_id,
            DomainSession {
                assistant_message_id: assistant_message_id.map(String::from),
                provider: provider.to_string(),
                model: model.to_string(),
                workspace_path: workspace_path.map(String::from),
                domain_id: result.domain_id.clone(),
                task_id: result.task_id.clone(),
            },
        );
    } else if matches!(status.as_str(), "completed" | "failed" | "aborted") {
        set_static(true).await;
        engine.clear_domain_session(chat_id);
    } else if let Some(error) = &result.error {
        set_static(false).await;
        ctx.bus.publish_content(chat_id, "error", error);
        engine.clear_domain_session(chat_id);
    } else {
        warn!(chat_id = %chat_id, status = %status, "Unexpected domain status, completing turn");
        set_static(true).await;
        engine.clear_domain_session(chat_id);
    }

    status
}

/// Parameters of a parked coder turn awaiting workspace selection.
#[derive(Debug, Clone)]
pub struct PendingExecution {
    pub chat_id: String,
    pub domain_id: String,
    pub message: String,
    pub provider: String,
    pub model: String,
    pub include_reasoning: bool,
    pub attached_file_ids: Vec<String>,
    pub user_message_id: String,
    pub chat_history: Vec<HistoryMessage>,
    pub assistant_message_id: Option<String>,
    pub router_decision_json: Option<String>,
}

/// Run a domain turn on the async engine. Handles workspace gating for
/// the coder domain and the web-view prompt for the web domain.
#[allow(clippy::too_many_arguments)]
pub async fn execute_domain_turn(
    engine: &Arc<AsyncEngine>,
    chat_id: &str,
    domain_id: &str,
    message: &str,
    chat_history: Vec<HistoryMessage>,
    attached_file_ids: &[String],
    provider: &str,
    model: &str,
    include_reasoning: bool,
    user_message_id: &str,
    router_decision_json: Option<String>,
) {
    let ctx = engine.ctx();

    // Coder tasks need a workspace on disk before anything can run
    let mut workspace_path: Option<String> = None;
    if domain_id == "coder" {
        workspace_path = engine.resolve_coder_workspace(chat_id).await;

        if workspace_path.is_none() {
            info!(chat_id = %chat_id, "Prompting user to select a coder workspace");

            if let Err(e) = ctx.store.update_chat_state(chat_id, ChatState::Thinking).await {
                warn!(chat_id = %chat_id, "Failed to set thinking state: {}", e);
            }
            ctx.bus.publish_state(chat_id, ChatState::Thinking);

            let assistant_message_id = match ctx
                .store
                .save_message(
                    chat_id,
                    SaveMessage {
                        provider: Some(provider.to_string()),
                        model: Some(model.to_string()),
                        router_enabled: router_decision_json.is_some(),
                        router_decision: router_decision_json.clone(),
                        ..SaveMessage::assistant(WORKSPACE_PROMPT_MESSAGE)
                    },
                )
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    error!(chat_id = %chat_id, "Failed to save workspace prompt message: {}", e);
                    None
                }
            };

            let prompt_payload = json!({
                "chat_id": chat_id,
                "message": message,
                "domain_id": domain_id,
            });
            ctx.bus
                .publish_content(chat_id, "coder_workspace_prompt", &prompt_payload.to_string());
            ctx.bus
                .publish_content(chat_id, "answer", WORKSPACE_PROMPT_MESSAGE);

            engine.set_workspace_pending(
                chat_id,
                PendingExecution {
                    chat_id: chat_id.to_string(),
                    domain_id: domain_id.to_string(),
                    message: message.to_string(),
                    provider: provider.to_string(),
                    model: model.to_string(),
                    include_reasoning,
                    attached_file_ids: attached_file_ids.to_vec(),
                    user_message_id: user_message_id.to_string(),
                    chat_history,
                    assistant_message_id,
                    router_decision_json,
                },
            );
            info!(chat_id = %chat_id, "Parked execution until workspace selection");
            return;
        }
    } else if domain_id == "web" {
        let profile_status = ctx.web.profile_status();
        ctx.bus.publish_event(
            Event::content(
                chat_id,
                "web_window_prompt",
                json!({
                    "chat_id": chat_id,
                    "domain_id": domain_id,
                    "profile_status": profile_status,
                    "user_request": message,
                })
                .to_string(),
            ),
        );
    }

    // Placeholder so streaming domain updates have a persistence target
    let assistant_message_id = match ctx
        .store
        .save_message(
            chat_id,
            SaveMessage {
                provider: Some(provider.to_string()),
                model: Some(model.to_string()),
                router_enabled: router_decision_json.is_some(),
                router_decision: router_decision_json.clone(),
                ..SaveMessage::assistant("")
            },
        )
        .await
    {
        Ok(id) => Some(id),
        Err(e) => {
            error!(chat_id = %chat_id, "Failed to create assistant placeholder: {}", e);
            None
        }
    };

    run_domain_task(
        engine,
        chat_id,
        domain_id,
        message,
        chat_history,
        attached_file_ids,
        assistant_message_id.as_deref(),
        workspace_path.as_deref(),
        provider,
        model,
    )
    .await;
}

/// Shared by the initial dispatch and the post-workspace resume.
#[allow(clippy::too_many_arguments)]
pub async fn run_domain_task(
    engine: &Arc<AsyncEngine>,
    chat_id: &str,
    domain_id: &str,
    message: &str,
    chat_history: Vec<HistoryMessage>,
    attached_file_ids: &[String],
    assistant_message_id: Option<&str>,
    workspace_path: Option<&str>,
    provider: &str,
    model: &str,
) {
    let ctx = engine.ctx();

    info!(
        chat_id = %chat_id,
        domain = %domain_id,
        workspace = workspace_path.unwrap_or("-"),
        files = attached_file_ids.len(),
        "Starting domain execution"
    );

    if let Err(e) = ctx.store.update_chat_state(chat_id, ChatState::Responding).await {
        warn!(chat_id = %chat_id, "Failed to set responding state: {}", e);
    }
    ctx.bus.publish_state(chat_id, ChatState::Responding);

    let mut attached_files = Vec::new();
    for file_id in attached_file_ids {
        if let Ok(Some(record)) = ctx.store.get_file_record(file_id).await {
            attached_files.push(AttachedFile {
                id: record.id,
                name: record.original_name,
            });
        }
    }

    let callback = domain_event_callback(engine, chat_id, workspace_path.map(String::from));
    let request = DomainTaskRequest {
        domain_id: domain_id.to_string(),
        user_request: message.to_string(),
        chat_id: chat_id.to_string(),
        chat_history,
        attached_files,
        assistant_message_id: assistant_message_id.map(String::from),
        workspace_path: workspace_path.map(String::from),
    };

    match ctx.domains.execute_domain_task(request, callback).await {
        Ok(result) => {
            let status = handle_domain_result(
                engine,
                chat_id,
                &result,
                result
                    .assistant_message_id
                    .as_deref()
                    .or(assistant_message_id),
                provider,
                model,
                workspace_path,
            )
            .await;
            info!(chat_id = %chat_id, status = %status, "Domain execution finished");
        }
        Err(e) => {
            error!(chat_id = %chat_id, "Domain execution failed: {}", e);
            engine.set_chat_static(chat_id).await;
            ctx.bus
                .publish_content(chat_id, "error", &format!("Async domain execution error: {e}"));
        }
    }
}
