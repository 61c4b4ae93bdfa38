// src/engine/mod.rs
// Async chat engine: a persistent scheduler thread hosting cooperative
// chat turns, with stop/cancel, workspace parking and domain sessions

pub mod domain;
pub mod retry;
mod stream_task;

pub use domain::{
    AttachedFile, DomainEvent, DomainEventCallback, DomainExecutor, DomainTaskRequest,
    DomainTaskResult, NullDomainExecutor, PendingExecution, ToolDecisionRequest,
};
pub use retry::{RetryConfig, RetryEvent};
pub(crate) use stream_task::persisted_router_json;

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ChatConfig;
use crate::events::EventBus;
use crate::limits::RateLimiter;
use crate::providers::ProviderMap;
use crate::router::RouterDecision;
use crate::store::{ChatState, ChatStore};
use crate::tools::ToolExecutor;
use crate::web::WebSessionManager;

const CLEARED_SESSION_SWEEP: Duration = Duration::from_secs(30);

/// Shared collaborators every chat turn needs.
pub struct EngineContext {
    pub store: ChatStore,
    pub bus: Arc<EventBus>,
    pub limiter: Arc<RateLimiter>,
    pub providers: ProviderMap,
    pub domains: Arc<dyn DomainExecutor>,
    pub tools: Arc<dyn ToolExecutor>,
    pub web: Arc<WebSessionManager>,
    pub chat: ChatConfig,
    pub retry: RetryConfig,
}

/// How a turn should terminate early: `Stop` persists accumulated
/// content, `Cancel` discards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Stop,
    Cancel,
}

/// A domain task that paused awaiting a user tool decision.
#[derive(Debug, Clone)]
pub struct DomainSession {
    pub assistant_message_id: Option<String>,
    pub provider: String,
    pub model: String,
    pub workspace_path: Option<String>,
    pub domain_id: Option<String>,
    pub task_id: Option<String>,
}

/// Everything needed to run one streaming turn.
#[derive(Debug, Clone)]
pub struct StreamTurnParams {
    pub chat_id: String,
    pub message: String,
    pub provider: String,
    pub model: String,
    pub include_reasoning: bool,
    pub attached_file_ids: Vec<String>,
    pub user_message_id: String,
    pub is_retry: bool,
    pub router_decision: Option<RouterDecision>,
    pub estimated_tokens: i64,
}

pub enum StartOutcome {
    Started,
    AlreadyProcessing,
    AtCapacity { max: usize },
}

struct ChatTask {
    cancel: CancellationToken,
}

/// The async engine. Turns run as tasks on a dedicated current-thread
/// scheduler; registries are guarded maps whose locks are never held
/// across an await point.
pub struct AsyncEngine {
    ctx: Arc<EngineContext>,
    scheduler: Handle,
    tasks: Mutex<HashMap<String, ChatTask>>,
    stop_flags: Mutex<HashMap<String, StopKind>>,
    workspace_pending: Mutex<HashMap<String, PendingExecution>>,
    domain_sessions: Mutex<HashMap<String, DomainSession>>,
    recently_cleared: Mutex<HashMap<String, Instant>>,
}

impl AsyncEngine {
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build async chat runtime");
        let scheduler = runtime.handle().clone();

        std::thread::Builder::new()
            .name("atlas-async-chat-loop".to_string())
            .spawn(move || {
                runtime.block_on(std::future::pending::<()>());
            })
            .expect("failed to spawn async chat loop thread");

        Arc::new(Self {
            ctx,
            scheduler,
            tasks: Mutex::new(HashMap::new()),
            stop_flags: Mutex::new(HashMap::new()),
            workspace_pending: Mutex::new(HashMap::new()),
            domain_sessions: Mutex::new(HashMap::new()),
            recently_cleared: Mutex::new(HashMap::new()),
        })
    }

    pub fn ctx(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn is_processing(&self, chat_id: &str) -> bool {
        self.tasks.lock().contains_key(chat_id)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Submit a streaming turn. Rejects when the chat already has a live
    /// task or the engine is at its concurrency ceiling.
    pub fn start_streaming_turn(self: &Arc<Self>, params: StreamTurnParams) -> StartOutcome {
        let chat_id = params.chat_id.clone();
        let cancel = CancellationToken::new();

        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(&chat_id) {
                warn!(chat_id = %chat_id, "Chat is already processing");
                return StartOutcome::AlreadyProcessing;
            }
            let max = self.ctx.chat.max_async_concurrent_chats;
            if tasks.len() >= max {
                warn!(
                    chat_id = %chat_id,
                    active = tasks.len(),
                    max,
                    "Concurrent async chat limit reached"
                );
                return StartOutcome::AtCapacity { max };
            }
            tasks.insert(
                chat_id.clone(),
                ChatTask {
                    cancel: cancel.clone(),
                },
            );
        }

        let engine = self.clone();
        self.scheduler.spawn(async move {
            stream_task::execute_streaming(engine.clone(), params, cancel).await;
            engine.cleanup_chat(&chat_id);
        });

        info!(active = self.active_count(), "Started async chat processing");
        StartOutcome::Started
    }

    /// Request graceful termination; accumulated partial content will be
    /// persisted. Returns false when nothing is running.
    pub fn stop_chat(&self, chat_id: &str) -> bool {
        self.stop_flags
            .lock()
            .insert(chat_id.to_string(), StopKind::Stop);

        let cancel = self.tasks.lock().get(chat_id).map(|t| t.cancel.clone());
        match cancel {
            Some(cancel) => {
                info!(chat_id = %chat_id, "Stop requested, partial content will be saved");
                cancel.cancel();
                true
            }
            None => {
                debug!(chat_id = %chat_id, "No active async task to stop");
                self.stop_flags.lock().remove(chat_id);
                false
            }
        }
    }

    /// Request termination with discard; also clears workspace-pending
    /// state and any live domain session.
    pub async fn cancel_chat(self: &Arc<Self>, chat_id: &str) -> bool {
        self.stop_flags
            .lock()
            .insert(chat_id.to_string(), StopKind::Cancel);

        let pending = self.workspace_pending.lock().remove(chat_id);
        if pending.is_some() {
            info!(chat_id = %chat_id, "Cancelled chat waiting for workspace selection");
            self.set_chat_static(chat_id).await;
            self.ctx.bus.publish_content(chat_id, "complete", "");
            self.stop_flags.lock().remove(chat_id);
            self.clear_domain_session(chat_id);
            return true;
        }

        let cancel = self.tasks.lock().get(chat_id).map(|t| t.cancel.clone());
        match cancel {
            Some(cancel) => {
                info!(chat_id = %chat_id, "Cancel requested, partial content will be discarded");
                cancel.cancel();
                self.clear_domain_session(chat_id);
                true
            }
            None => {
                debug!(chat_id = %chat_id, "No active async task to cancel");
                self.stop_flags.lock().remove(chat_id);
                self.clear_domain_session(chat_id);
                false
            }
        }
    }

    /// Drop the task entry and stop flag. Safe to call repeatedly;
    /// workspace-pending state survives so coder flows can resume.
    pub fn cleanup_chat(&self, chat_id: &str) {
        let removed = self.tasks.lock().remove(chat_id);
        self.stop_flags.lock().remove(chat_id);
        if removed.is_some() {
            debug!(chat_id = %chat_id, "Cleaned up async chat resources");
        }
    }

    /// Consume the stop/cancel flag for a chat; absent means cancel.
    pub(crate) fn take_stop_kind(&self, chat_id: &str) -> StopKind {
        self.stop_flags
            .lock()
            .remove(chat_id)
            .unwrap_or(StopKind::Cancel)
    }

    pub fn is_waiting_for_workspace(&self, chat_id: &str) -> bool {
        self.workspace_pending.lock().contains_key(chat_id)
    }

    pub(crate) fn set_workspace_pending(&self, chat_id: &str, pending: PendingExecution) {
        self.workspace_pending
            .lock()
            .insert(chat_id.to_string(), pending);
    }

    /// Resume a coder turn after the user selected a workspace. Returns
    /// false when there is nothing parked or the workspace is unusable.
    pub async fn resume_after_workspace_selection(self: &Arc<Self>, chat_id: &str) -> bool {
        let Some(pending) = self.workspace_pending.lock().remove(chat_id) else {
            warn!(chat_id = %chat_id, "No pending execution to resume");
            return false;
        };

        let Some(workspace_path) = self.resolve_coder_workspace(chat_id).await else {
            error!(chat_id = %chat_id, "Workspace path unavailable after selection");
            self.set_chat_static(chat_id).await;
            self.ctx.bus.publish_content(
                chat_id,
                "error",
                "Failed to retrieve workspace path after selection",
            );
            self.ctx.bus.publish_content(chat_id, "complete", "");
            return false;
        };

        {
            let mut tasks = self.tasks.lock();
            if tasks.contains_key(chat_id) {
                warn!(chat_id = %chat_id, "Chat is already processing, not resuming");
                return false;
            }
            tasks.insert(
                chat_id.to_string(),
                ChatTask {
                    cancel: CancellationToken::new(),
                },
            );
        }

        info!(chat_id = %chat_id, workspace = %workspace_path, "Resuming after workspace selection");

        let engine = self.clone();
        let chat_id_owned = chat_id.to_string();
        self.scheduler.spawn(async move {
            domain::run_domain_task(
                &engine,
                &pending.chat_id,
                &pending.domain_id,
                &pending.message,
                pending.chat_history.clone(),
                &pending.attached_file_ids,
                pending.assistant_message_id.as_deref(),
                Some(&workspace_path),
                &pending.provider,
                &pending.model,
            )
            .await;
            engine.cleanup_chat(&chat_id_owned);
        });
        true
    }

    // === Domain sessions ===

    pub fn has_domain_session(&self, chat_id: &str) -> bool {
        self.domain_sessions.lock().contains_key(chat_id)
    }

    pub fn get_domain_session(&self, chat_id: &str) -> Option<DomainSession> {
        self.domain_sessions.lock().get(chat_id).cloned()
    }

    pub fn set_domain_session(&self, chat_id: &str, session: DomainSession) {
        self.domain_sessions
            .lock()
            .insert(chat_id.to_string(), session);
        debug!(chat_id = %chat_id, "Domain session updated");
    }

    pub fn clear_domain_session(&self, chat_id: &str) {
        if self.domain_sessions.lock().remove(chat_id).is_some() {
            debug!(chat_id = %chat_id, "Domain session cleared");
            let mut cleared = self.recently_cleared.lock();
            cleared.insert(chat_id.to_string(), Instant::now());
            cleared.retain(|_, at| at.elapsed() < CLEARED_SESSION_SWEEP);
        }
    }

    /// True when the chat's domain session completed within the stale
    /// grace window, so a duplicate approval should be absorbed.
    pub fn was_recently_cleared(&self, chat_id: &str) -> bool {
        let grace = Duration::from_secs(self.ctx.chat.stale_decision_grace_secs);
        self.recently_cleared
            .lock()
            .get(chat_id)
            .map(|at| at.elapsed() < grace)
            .unwrap_or(false)
    }

    /// Handle a tool decision for an async-managed domain session.
    /// Returns `None` when no session is registered here (the caller
    /// falls back to the worker path), or the response envelope.
    pub async fn handle_tool_decision(
        self: &Arc<Self>,
        decision: ToolDecisionRequest,
    ) -> Option<Value> {
        let chat_id = decision.chat_id.clone();
        let Some(session) = self.get_domain_session(&chat_id) else {
            if self.was_recently_cleared(&chat_id) {
                info!(
                    chat_id = %chat_id,
                    "Ignoring tool decision for recently cleared session (duplicate approval)"
                );
                return Some(json!({
                    "success": true,
                    "chat_id": chat_id,
                    "task_id": decision.task_id,
                    "status": "completed",
                    "message": "Task already completed, ignoring duplicate approval",
                    "stale_request": true,
                }));
            }
            debug!(chat_id = %chat_id, "No async domain session, deferring to worker");
            return None;
        };

        info!(chat_id = %chat_id, task_id = %decision.task_id, "Handling tool decision in async engine");

        if let Err(e) = self
            .ctx
            .store
            .update_chat_state(&chat_id, ChatState::Responding)
            .await
        {
            warn!(chat_id = %chat_id, "Failed to set responding state: {}", e);
        }
        self.ctx.bus.publish_state(&chat_id, ChatState::Responding);

        let callback =
            domain::domain_event_callback(self, &chat_id, session.workspace_path.clone());
        let result = match self
            .ctx
            .domains
            .handle_tool_decision(decision.clone(), callback)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(chat_id = %chat_id, "Tool decision failed: {}", e);
                self.set_chat_static(&chat_id).await;
                self.ctx
                    .bus
                    .publish_content(&chat_id, "error", &format!("Async tool decision error: {e}"));
                self.clear_domain_session(&chat_id);
                return Some(json!({
                    "success": false,
                    "chat_id": chat_id,
                    "task_id": decision.task_id,
                    "call_id": decision.call_id,
                    "decision": decision.decision,
                    "error": format!("Failed to handle tool decision: {e}"),
                }));
            }
        };

        let assistant_for_update = result
            .assistant_message_id
            .clone()
            .or(decision.assistant_message_id.clone())
            .or(session.assistant_message_id.clone());

        let status = domain::handle_domain_result(
            self,
            &chat_id,
            &result,
            assistant_for_update.as_deref(),
            &session.provider,
            &session.model,
            session.workspace_path.as_deref(),
        )
        .await;

        if status == "waiting_user" {
            if let Some(mut session) = self.get_domain_session(&chat_id) {
                session.assistant_message_id = assistant_for_update;
                self.set_domain_session(&chat_id, session);
            }
        }

        let mut response = json!({
            "success": result.error.is_none(),
            "chat_id": chat_id,
            "task_id": decision.task_id,
            "call_id": decision.call_id,
            "decision": decision.decision,
            "status": result.status,
        });
        if let Some(error) = &result.error {
            response["error"] = json!(error);
        }
        Some(response)
    }

    // === Helpers shared with the domain path ===

    /// Reset the chat to `static` in the store and on the bus, logging
    /// rather than propagating persistence failures.
    pub async fn set_chat_static(&self, chat_id: &str) {
        if let Err(e) = self.ctx.store.update_chat_state(chat_id, ChatState::Static).await {
            error!(chat_id = %chat_id, "Failed to reset chat state: {}", e);
        }
        self.ctx.bus.publish_state(chat_id, ChatState::Static);
    }

    /// Workspace mapped to a chat, only if it still exists on disk.
    pub async fn resolve_coder_workspace(&self, chat_id: &str) -> Option<String> {
        match self.ctx.store.get_coder_workspace(chat_id).await {
            Ok(Some(path)) => {
                if Path::new(&path).exists() {
                    Some(path)
                } else {
                    warn!(chat_id = %chat_id, path = %path, "Workspace path missing on disk");
                    None
                }
            }
            Ok(None) => {
                debug!(chat_id = %chat_id, "No workspace mapping found");
                None
            }
            Err(e) => {
                error!(chat_id = %chat_id, "Failed to fetch workspace: {}", e);
                None
            }
        }
    }
}
