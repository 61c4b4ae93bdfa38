// src/dispatch/mod.rs
// Per-turn entry point: dedup, user-message persistence, routing, rate
// reservation, and engine/pool selection

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::{estimate_by_chars, ContextManager};
use crate::engine::{
    persisted_router_json, AsyncEngine, StartOutcome, StreamTurnParams, ToolDecisionRequest,
};
use crate::events::Event;
use crate::providers::HistoryMessage;
use crate::router::{ModelRouter, RouterDecision};
use crate::store::SaveMessage;
use crate::worker::{WorkerCommand, WorkerPool};

/// Body of a `/chat/stream` request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamRequest {
    pub chat_id: Option<String>,
    pub message: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_true")]
    pub include_reasoning: bool,
    #[serde(default)]
    pub attached_file_ids: Vec<String>,
    #[serde(default)]
    pub is_retry: bool,
    pub existing_message_id: Option<String>,
    #[serde(default)]
    pub is_edit_regeneration: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// Background processing started; stream the content queue.
    Started,
    /// A turn is already live for this chat; attach to its stream.
    AlreadyProcessing,
    /// Same (chat_id, message) within the duplicate window.
    Duplicate,
    /// The request could not start at all.
    Rejected(String),
}

pub struct Dispatcher {
    engine: Arc<AsyncEngine>,
    pool: Arc<WorkerPool>,
    router: ModelRouter,
    dedup_cache: Mutex<HashMap<String, Instant>>,
}

impl Dispatcher {
    pub fn new(engine: Arc<AsyncEngine>, pool: Arc<WorkerPool>, router: ModelRouter) -> Self {
        Self {
            engine,
            pool,
            router,
            dedup_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<AsyncEngine> {
        &self.engine
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn is_processing(&self, chat_id: &str) -> bool {
        self.engine.is_processing(chat_id)
            || self.pool.is_processing(chat_id)
            || self.engine.is_waiting_for_workspace(chat_id)
    }

    /// Resolve the chat id for a request, creating the chat on first
    /// contact.
    pub async fn ensure_chat(&self, requested: Option<&str>) -> anyhow::Result<String> {
        let ctx = self.engine.ctx();
        let chat_id = match requested {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Uuid::new_v4().to_string(),
        };
        if !ctx.store.chat_exists(&chat_id).await? {
            info!(chat_id = %chat_id, "Creating new chat");
            ctx.store.create_chat(&chat_id, None).await?;
        }
        Ok(chat_id)
    }

    /// Start one user turn. The returned outcome tells the HTTP layer
    /// whether to stream live events, attach to an existing stream, or
    /// emit a one-event error stream.
    pub async fn start_turn(&self, chat_id: &str, request: &StreamRequest) -> DispatchOutcome {
        let ctx = self.engine.ctx().clone();

        // Edit-regeneration replays the content of an existing message
        let mut message = match &request.message {
            Some(message) => message.clone(),
            None => return DispatchOutcome::Rejected("Message is required".to_string()),
        };
        if request.is_edit_regeneration {
            if let Some(existing_id) = &request.existing_message_id {
                match ctx.store.get_message(existing_id).await {
                    Ok(Some(existing)) => message = existing.content,
                    Ok(None) => {
                        return DispatchOutcome::Rejected("Existing message not found".to_string())
                    }
                    Err(e) => return DispatchOutcome::Rejected(format!("Database error: {e}")),
                }
            }
        }

        // Retries and regenerations legitimately repeat content
        if !request.is_retry && !request.is_edit_regeneration && self.is_duplicate(chat_id, &message)
        {
            return DispatchOutcome::Duplicate;
        }

        if self.is_processing(chat_id) {
            return DispatchOutcome::AlreadyProcessing;
        }

        let mut provider = request
            .provider
            .clone()
            .unwrap_or_else(|| ctx.chat.default_provider.clone());
        let mut model = request
            .model
            .clone()
            .unwrap_or_else(|| ctx.chat.default_model.clone());

        // Router preflight selects the route/model/domain and is
        // broadcast so clients can render the decision immediately
        let mut router_decision: Option<RouterDecision> = None;
        if ctx.chat.router_enabled {
            let history_len = ctx
                .store
                .get_chat_history(chat_id)
                .await
                .map(|h| h.len())
                .unwrap_or(0);
            let decision = self.router.route_request(&message, history_len);
            self.publish_router_decision(chat_id, &decision);
            if let Some(selected) = &decision.provider {
                provider = selected.clone();
            }
            if let Some(selected) = &decision.model {
                model = selected.clone();
            }
            router_decision = Some(decision);
        }

        // Persist (or locate) the user message for this turn
        let (user_message_id, attached_file_ids) = match self
            .prepare_user_message(chat_id, &message, request, router_decision.as_ref())
            .await
        {
            Ok(prepared) => prepared,
            Err(e) => return DispatchOutcome::Rejected(format!("Failed to save message: {e}")),
        };

        // Reasoning only makes sense when the provider supports it
        let include_reasoning = request.include_reasoning
            && ctx
                .providers
                .get(&provider)
                .map(|p| p.supports_reasoning(&model))
                .unwrap_or(false);

        let estimated_tokens = self
            .estimate_tokens(chat_id, &provider, &model, &message)
            .await;

        // A reservation failure must not block the turn; the provider's
        // own 429 is the backstop
        match ctx
            .limiter
            .check_and_reserve(&provider, &model, estimated_tokens)
            .await
        {
            Ok(()) => {
                info!(
                    chat_id = %chat_id,
                    provider = %provider,
                    model = %model,
                    estimated_tokens,
                    "Reserved rate limit capacity"
                );
            }
            Err(e) => {
                error!(chat_id = %chat_id, "Rate limit reservation failed: {}", e);
            }
        }

        let params = StreamTurnParams {
            chat_id: chat_id.to_string(),
            message,
            provider,
            model,
            include_reasoning,
            attached_file_ids,
            user_message_id,
            is_retry: request.is_retry,
            router_decision: router_decision.clone(),
            estimated_tokens,
        };

        let use_worker = ctx.chat.execution_mode == "worker"
            || router_decision
                .as_ref()
                .and_then(|d| d.execution_type.as_deref())
                == Some("worker");

        if use_worker {
            match self.pool.start_worker_turn(params).await {
                Ok(true) => DispatchOutcome::Started,
                Ok(false) => DispatchOutcome::AlreadyProcessing,
                Err(e) => {
                    error!(chat_id = %chat_id, "Worker dispatch failed: {}", e);
                    ctx.bus
                        .publish_content(chat_id, "error", &format!("Worker dispatch failed: {e}"));
                    DispatchOutcome::Rejected(e.to_string())
                }
            }
        } else {
            match self.engine.start_streaming_turn(params) {
                StartOutcome::Started => DispatchOutcome::Started,
                StartOutcome::AlreadyProcessing => DispatchOutcome::AlreadyProcessing,
                StartOutcome::AtCapacity { max } => {
                    ctx.bus.publish_content(
                        chat_id,
                        "error",
                        &format!(
                            "Server is currently at maximum capacity ({max} concurrent chats). Please try again in a moment."
                        ),
                    );
                    DispatchOutcome::Rejected("at capacity".to_string())
                }
            }
        }
    }

    /// Graceful stop: partial content is persisted.
    pub fn stop_chat(&self, chat_id: &str) -> bool {
        if self.engine.stop_chat(chat_id) {
            return true;
        }
        self.pool.send_command(chat_id, WorkerCommand::Stop)
    }

    /// Hard cancel: partial content is discarded.
    pub async fn cancel_chat(&self, chat_id: &str) -> bool {
        if self.engine.cancel_chat(chat_id).await {
            return true;
        }
        self.pool.send_command(chat_id, WorkerCommand::Cancel)
    }

    /// Route a tool decision to whichever engine owns the session.
    pub async fn send_domain_tool_decision(&self, decision: ToolDecisionRequest) -> Value {
        if let Some(response) = self.engine.handle_tool_decision(decision.clone()).await {
            return response;
        }

        // No async session: forward to the worker currently serving the
        // chat, if any
        let delivered = self.pool.send_command(
            &decision.chat_id,
            WorkerCommand::DomainToolDecision {
                chat_id: decision.chat_id.clone(),
                task_id: decision.task_id.clone(),
                call_id: decision.call_id.clone(),
                decision: decision.decision.clone(),
                assistant_message_id: decision.assistant_message_id.clone(),
                batch_mode: decision.batch_mode,
                pre_executed_calls: decision.pre_executed_calls.clone(),
                pre_execution_state: decision.pre_execution_state.clone(),
            },
        );

        if delivered {
            json!({
                "success": true,
                "chat_id": decision.chat_id,
                "task_id": decision.task_id,
                "status": "forwarded",
            })
        } else {
            json!({
                "success": false,
                "chat_id": decision.chat_id,
                "task_id": decision.task_id,
                "error": "No active execution found for this chat",
            })
        }
    }

    /// The user picked a workspace; resume whichever engine parked.
    pub async fn workspace_selected(&self, chat_id: &str) -> Value {
        if self.engine.resume_after_workspace_selection(chat_id).await {
            return json!({"success": true, "chat_id": chat_id});
        }

        let delivered = self.pool.send_command(
            chat_id,
            WorkerCommand::WorkspaceSelected {
                chat_id: chat_id.to_string(),
            },
        );
        json!({"success": delivered, "chat_id": chat_id})
    }

    fn publish_router_decision(&self, chat_id: &str, decision: &RouterDecision) {
        if let Some(error) = &decision.error {
            warn!(chat_id = %chat_id, route = %decision.route, "Router returned error: {}", error);
        }
        self.engine.ctx().bus.broadcast(
            Event::global("router_decision")
                .with_meta("chat_id", json!(chat_id))
                .with_meta("selected_route", json!(decision.route))
                .with_meta("available_routes", json!(decision.available_routes))
                .with_meta("selected_model", json!(decision.model))
                .with_meta("selected_provider", json!(decision.provider))
                .with_meta("tools_needed", json!(decision.tools_needed))
                .with_meta("execution_type", json!(decision.execution_type))
                .with_meta("fastpath_params", json!(decision.fastpath_params))
                .with_meta("error", json!(decision.error)),
        );
    }

    /// Persist the user message for a fresh turn, or locate the one a
    /// retry/edit-regeneration reuses along with its attachments.
    async fn prepare_user_message(
        &self,
        chat_id: &str,
        message: &str,
        request: &StreamRequest,
        router_decision: Option<&RouterDecision>,
    ) -> anyhow::Result<(String, Vec<String>)> {
        let ctx = self.engine.ctx();
        let mut attached_file_ids = request.attached_file_ids.clone();

        if request.is_edit_regeneration {
            if let Some(existing_id) = &request.existing_message_id {
                if attached_file_ids.is_empty() {
                    attached_file_ids = ctx
                        .store
                        .get_message_files(existing_id)
                        .await
                        .map(|files| files.into_iter().map(|f| f.id).collect())
                        .unwrap_or_default();
                }
                return Ok((existing_id.clone(), attached_file_ids));
            }
        }

        if request.is_retry {
            let history = ctx.store.get_chat_history(chat_id).await?;
            let last_user = history.iter().rev().find(|m| m.role == "user");
            if let Some(last_user) = last_user {
                if attached_file_ids.is_empty() {
                    attached_file_ids = ctx
                        .store
                        .get_message_files(&last_user.id)
                        .await
                        .map(|files| files.into_iter().map(|f| f.id).collect())
                        .unwrap_or_default();
                }
                return Ok((last_user.id.clone(), attached_file_ids));
            }
            // Fall through: a retry on an empty chat persists normally
        }

        let user_message_id = ctx
            .store
            .save_message(
                chat_id,
                SaveMessage {
                    attached_file_ids: attached_file_ids.clone(),
                    router_enabled: router_decision.is_some(),
                    router_decision: router_decision.map(persisted_router_json),
                    ..SaveMessage::user(message)
                },
            )
            .await?;
        Ok((user_message_id, attached_file_ids))
    }

    async fn estimate_tokens(
        &self,
        chat_id: &str,
        provider_name: &str,
        model: &str,
        message: &str,
    ) -> i64 {
        let ctx = self.engine.ctx();
        let mut history = ctx
            .store
            .get_chat_history(chat_id)
            .await
            .unwrap_or_default();
        if history.last().map(|m| m.role == "user").unwrap_or(false) {
            history.pop();
        }
        let history: Vec<HistoryMessage> = history
            .into_iter()
            .map(|m| HistoryMessage {
                role: m.role,
                content: m.content,
            })
            .collect();
        let system_prompt = ctx
            .store
            .get_chat_system_prompt(chat_id)
            .await
            .unwrap_or_default();

        match ctx.providers.get(provider_name) {
            Some(provider) => ContextManager::estimate_request_tokens(
                provider.as_ref(),
                model,
                system_prompt.as_deref(),
                &history,
                message,
            ),
            None => estimate_by_chars(message),
        }
    }

    /// Same (chat_id, message) pair within the window counts as a
    /// duplicate; expired entries are swept on each check.
    fn is_duplicate(&self, chat_id: &str, message: &str) -> bool {
        let window = Duration::from_millis(self.engine.ctx().chat.duplicate_window_ms);
        let key = format!("{chat_id}:{message}");
        let now = Instant::now();

        let mut cache = self.dedup_cache.lock();
        cache.retain(|_, at| now.duration_since(*at) <= window);

        if let Some(at) = cache.get(&key) {
            if now.duration_since(*at) <= window {
                let preview: String = message.chars().take(50).collect();
                info!(chat_id = %chat_id, "Duplicate message blocked: '{}...'", preview);
                return true;
            }
        }
        cache.insert(key, now);
        false
    }
}
