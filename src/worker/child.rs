// src/worker/child.rs
// Worker-side engine: the subprocess half of the pool protocol. Mirrors
// the async engine's turn algorithm but reports through the parent pipe.

use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{Stdin, Stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LengthDelimitedCodec};
use tracing::{error, info, warn};

use super::protocol::{read_frame, write_frame, FramedJson, WorkerCommand, WorkerEvent};
use crate::config::ChatConfig;
use crate::context::ContextManager;
use crate::engine::domain::{
    derive_file_change_events, AttachedFile, DomainEvent, DomainEventCallback, DomainExecutor,
    DomainTaskRequest, DomainTaskResult, ToolDecisionRequest, WORKSPACE_PROMPT_MESSAGE,
};
use crate::engine::retry::{RetryConfig, RetryEvent};
use crate::providers::{ChatStreamRequest, HistoryMessage, ProviderMap, StreamChunk};
use crate::router::fastpath::{parse_fastpath_params, wrap_fastpath_output};
use crate::store::{ChatState, ChatStore, SaveMessage};
use crate::tools::{format_tool_output, ToolExecutor};

type CommandReader = FramedRead<Stdin, LengthDelimitedCodec>;

pub struct WorkerChild {
    store: ChatStore,
    providers: ProviderMap,
    domains: Arc<dyn DomainExecutor>,
    tools: Arc<dyn ToolExecutor>,
    chat: ChatConfig,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

/// Entry point for the `atlas-worker` binary: initialize, handshake,
/// then serve commands until the pipe closes.
pub async fn run_worker(
    database_url: &str,
    domains: Arc<dyn DomainExecutor>,
    tools: Arc<dyn ToolExecutor>,
) -> anyhow::Result<()> {
    let channel: FramedJson<Stdin, Stdout> =
        FramedJson::new(tokio::io::stdin(), tokio::io::stdout());
    let (mut commands, mut writer) = channel.split();

    let store = match ChatStore::connect(database_url).await {
        Ok(store) => store,
        Err(e) => {
            let error = format!("Chat worker initialization failed: {e}");
            error!("{}", error);
            write_frame(
                &mut writer,
                &WorkerEvent::Handshake {
                    success: false,
                    chat_id: None,
                    error: Some(error),
                },
            )
            .await?;
            return Ok(());
        }
    };

    // All events funnel through one forwarder so ordering is preserved
    // no matter which task produced them
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if write_frame(&mut writer, &event).await.is_err() {
                break;
            }
        }
    });

    let child = WorkerChild {
        store,
        providers: ProviderMap::standard(),
        domains,
        tools,
        chat: crate::config::CONFIG.chat.clone(),
        events: event_tx.clone(),
    };

    child.emit(WorkerEvent::Handshake {
        success: true,
        chat_id: None,
        error: None,
    });
    info!("Chat worker ready");

    // Commands are handled strictly one at a time
    while let Some(command) = read_frame::<_, WorkerCommand>(&mut commands).await? {
        match command {
            WorkerCommand::Process {
                chat_id,
                message,
                provider,
                model,
                include_reasoning,
                attached_file_ids,
                user_message_id,
                router_decision,
                estimated_tokens,
            } => {
                child
                    .process_turn(
                        &mut commands,
                        &chat_id,
                        &message,
                        &provider,
                        &model,
                        include_reasoning,
                        &attached_file_ids,
                        &user_message_id,
                        router_decision,
                        estimated_tokens,
                    )
                    .await;
            }
            WorkerCommand::DomainToolDecision {
                chat_id,
                task_id,
                call_id,
                decision,
                assistant_message_id,
                batch_mode,
                pre_executed_calls,
                pre_execution_state,
            } => {
                child
                    .handle_tool_decision(ToolDecisionRequest {
                        chat_id,
                        task_id,
                        call_id,
                        decision,
                        assistant_message_id,
                        batch_mode,
                        pre_executed_calls,
                        pre_execution_state,
                    })
                    .await;
            }
            WorkerCommand::Stop | WorkerCommand::Cancel => {
                // Nothing is running; acknowledge and stay available
                child.emit(WorkerEvent::Done {
                    success: true,
                    chat_id: None,
                    error: None,
                    stopped_during_stream: false,
                    cancelled: matches!(command, WorkerCommand::Cancel),
                });
            }
            WorkerCommand::WorkspaceSelected { chat_id } => {
                warn!(chat_id = %chat_id, "workspace_selected with no pending wait");
            }
        }
    }

    drop(child);
    drop(event_tx);
    let _ = forwarder.await;
    Ok(())
}

impl WorkerChild {
    fn emit(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    async fn set_state(&self, chat_id: &str, state: ChatState) {
        if let Err(e) = self.store.update_chat_state(chat_id, state).await {
            warn!(chat_id = %chat_id, "Failed to update chat state: {}", e);
        }
        self.emit(WorkerEvent::StateUpdate {
            chat_id: chat_id.to_string(),
            state,
        });
    }

    fn done(&self, chat_id: &str, success: bool, error: Option<String>) {
        self.emit(WorkerEvent::Done {
            success,
            chat_id: Some(chat_id.to_string()),
            error,
            stopped_during_stream: false,
            cancelled: false,
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_turn(
        &self,
        commands: &mut CommandReader,
        chat_id: &str,
        message: &str,
        provider_name: &str,
        model: &str,
        include_reasoning: bool,
        attached_file_ids: &[String],
        user_message_id: &str,
        router_decision: Option<crate::router::RouterDecision>,
        estimated_tokens: i64,
    ) {
        info!(chat_id = %chat_id, provider = %provider_name, model = %model, "Worker processing message");

        let Some(provider) = self.providers.get(provider_name) else {
            self.fail_turn(chat_id, None, &format!("Provider '{provider_name}' not available"))
                .await;
            return;
        };
        if !provider.is_available() {
            self.fail_turn(chat_id, None, &format!("Provider '{provider_name}' not available"))
                .await;
            return;
        }

        let use_reasoning = include_reasoning && provider.supports_reasoning(model);

        let mut chat_history = match self.store.get_chat_history(chat_id).await {
            Ok(history) => history,
            Err(e) => {
                self.fail_turn(chat_id, None, &format!("Failed to load history: {e}"))
                    .await;
                return;
            }
        };
        if chat_history.last().map(|m| m.role == "user").unwrap_or(false) {
            chat_history.pop();
        }
        let history: Vec<HistoryMessage> = chat_history
            .iter()
            .map(|m| HistoryMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect();

        let system_prompt = self
            .store
            .get_chat_system_prompt(chat_id)
            .await
            .unwrap_or_default();

        // FastPath tool execution before the model sees the query
        let mut message = message.to_string();
        if let Some(fastpath) = router_decision
            .as_ref()
            .and_then(|d| d.fastpath_params.as_deref())
        {
            if let Some(call) = parse_fastpath_params(fastpath) {
                let ctx_id = format!("fastpath_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
                match self.tools.execute(&call.tool, &call.params, &ctx_id).await {
                    Ok(output) => {
                        message =
                            wrap_fastpath_output(&format_tool_output(&call.tool, &output), &message);
                        info!(chat_id = %chat_id, tool = %call.tool, "Prepended FastPath tool output");
                    }
                    Err(e) => {
                        error!(chat_id = %chat_id, tool = %call.tool, "FastPath tool failed: {}", e);
                    }
                }
            }
        }

        let file_attachments = self
            .store
            .resolve_api_file_names(attached_file_ids, provider_name, &self.chat.default_provider)
            .await
            .unwrap_or_default();

        let router_json = router_decision
            .as_ref()
            .map(crate::engine::persisted_router_json);

        let assistant_message_id = match self
            .store
            .save_message(
                chat_id,
                SaveMessage {
                    provider: Some(provider_name.to_string()),
                    model: Some(model.to_string()),
                    router_enabled: router_decision.is_some(),
                    router_decision: router_json.clone(),
                    ..SaveMessage::assistant("")
                },
            )
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.fail_turn(chat_id, None, &format!("Failed to create placeholder: {e}"))
                    .await;
                return;
            }
        };

        if let Err(e) = self
            .store
            .record_version_assistant_lineage(chat_id, &assistant_message_id)
            .await
        {
            warn!(chat_id = %chat_id, "Failed to record assistant lineage: {}", e);
        }

        self.emit(
            WorkerEvent::content(
                chat_id,
                "message_ids",
                json!({
                    "user_message_id": user_message_id,
                    "assistant_message_id": assistant_message_id,
                })
                .to_string(),
            ),
        );

        // Domain routes execute through the agent planner instead of the
        // plain stream
        if let Some(decision) = router_decision.as_ref().filter(|d| d.is_domain_execution()) {
            let domain_id = decision.domain_id.clone().unwrap_or_default();
            self.execute_domain_task(
                commands,
                chat_id,
                &domain_id,
                &message,
                history,
                attached_file_ids,
                &assistant_message_id,
            )
            .await;
            return;
        }

        let request = ChatStreamRequest {
            message,
            model: model.to_string(),
            include_thoughts: use_reasoning,
            system_prompt,
            chat_history: history,
            file_attachments,
        };

        let mut current_state = if use_reasoning {
            ChatState::Thinking
        } else {
            ChatState::Responding
        };
        self.set_state(chat_id, current_state).await;

        let retry = RetryConfig::default();
        let throttle = Duration::from_millis(self.chat.db_update_throttle_ms);
        let mut full_text = String::new();
        let mut full_thoughts = String::new();
        let mut captured_usage = None;
        let mut answer_started = false;
        let mut last_flush = Instant::now();
        let mut attempt = 0usize;

        'attempts: loop {
            let mut stream = match provider.stream_chat(request.clone()).await {
                Ok(stream) => stream,
                Err(e) => {
                    if e.is_retryable() && attempt + 1 < retry.max_attempts {
                        attempt += 1;
                        self.emit_retry(chat_id, model, &retry, attempt, &e.to_string()).await;
                        full_text.clear();
                        full_thoughts.clear();
                        captured_usage = None;
                        answer_started = false;
                        current_state = self.reset_state_for_retry(chat_id, use_reasoning).await;
                        continue 'attempts;
                    }
                    self.set_state(chat_id, ChatState::Static).await;
                    self.emit(WorkerEvent::content(chat_id, "error", e.to_string()));
                    self.done(chat_id, false, Some(e.to_string()));
                    return;
                }
            };

            loop {
                tokio::select! {
                    command = read_frame::<_, WorkerCommand>(commands) => {
                        match command {
                            Ok(Some(WorkerCommand::Cancel)) => {
                                info!(chat_id = %chat_id, "Processing cancelled mid-stream");
                                self.set_state(chat_id, ChatState::Static).await;
                                self.emit(WorkerEvent::Done {
                                    success: true,
                                    chat_id: Some(chat_id.to_string()),
                                    error: None,
                                    stopped_during_stream: false,
                                    cancelled: true,
                                });
                                return;
                            }
                            Ok(Some(WorkerCommand::Stop)) => {
                                info!(chat_id = %chat_id, "Stop requested mid-stream, saving partial content");
                                if !full_text.is_empty() || !full_thoughts.is_empty() {
                                    let thoughts = (!full_thoughts.is_empty()).then_some(full_thoughts.as_str());
                                    if let Err(e) = self
                                        .store
                                        .update_message(&assistant_message_id, &full_text, thoughts, None)
                                        .await
                                    {
                                        error!(chat_id = %chat_id, "Failed to save partial content: {}", e);
                                    }
                                }
                                self.set_state(chat_id, ChatState::Static).await;
                                self.emit(WorkerEvent::content(chat_id, "complete", ""));
                                self.emit(WorkerEvent::Done {
                                    success: true,
                                    chat_id: Some(chat_id.to_string()),
                                    error: None,
                                    stopped_during_stream: true,
                                    cancelled: false,
                                });
                                return;
                            }
                            Ok(Some(other)) => {
                                warn!(chat_id = %chat_id, "Ignoring command mid-stream: {:?}", other);
                            }
                            Ok(None) => {
                                warn!(chat_id = %chat_id, "Command pipe closed mid-stream");
                                return;
                            }
                            Err(e) => {
                                error!(chat_id = %chat_id, "Command read failed mid-stream: {}", e);
                                return;
                            }
                        }
                    }
                    chunk = stream.next() => {
                        match chunk {
                            None => break 'attempts,
                            Some(Err(e)) => {
                                if e.is_retryable() && attempt + 1 < retry.max_attempts {
                                    attempt += 1;
                                    self.emit_retry(chat_id, model, &retry, attempt, &e.to_string()).await;
                                    full_text.clear();
                                    full_thoughts.clear();
                                    captured_usage = None;
                                    answer_started = false;
                                    current_state = self.reset_state_for_retry(chat_id, use_reasoning).await;
                                    continue 'attempts;
                                }
                                self.set_state(chat_id, ChatState::Static).await;
                                self.emit(WorkerEvent::content(chat_id, "error", e.to_string()));
                                self.done(chat_id, false, Some(e.to_string()));
                                return;
                            }
                            Some(Ok(chunk)) => {
                                match chunk {
                                    StreamChunk::ThoughtsStart => {
                                        self.emit(WorkerEvent::content(chat_id, "thoughts_start", ""));
                                    }
                                    StreamChunk::Thoughts { content } => {
                                        full_thoughts.push_str(&content);
                                        self.emit(WorkerEvent::content(chat_id, "thoughts", content));
                                    }
                                    StreamChunk::AnswerStart => {
                                        if current_state == ChatState::Thinking {
                                            current_state = ChatState::Responding;
                                            self.set_state(chat_id, current_state).await;
                                        }
                                        if !answer_started {
                                            answer_started = true;
                                            self.emit(WorkerEvent::content(chat_id, "answer_start", ""));
                                        }
                                    }
                                    StreamChunk::Answer { content } => {
                                        full_text.push_str(&content);
                                        if !answer_started {
                                            if current_state == ChatState::Thinking {
                                                current_state = ChatState::Responding;
                                                self.set_state(chat_id, current_state).await;
                                            }
                                            answer_started = true;
                                            self.emit(WorkerEvent::content(chat_id, "answer_start", ""));
                                        }
                                        self.emit(WorkerEvent::content(chat_id, "answer", content));
                                    }
                                    StreamChunk::Usage { usage } => {
                                        captured_usage = Some(usage.clone());
                                        self.emit(
                                            WorkerEvent::content(chat_id, "usage", "")
                                                .with_meta("usage", usage),
                                        );
                                    }
                                }

                                if last_flush.elapsed() >= throttle
                                    && (!full_text.is_empty() || !full_thoughts.is_empty())
                                {
                                    let thoughts =
                                        (!full_thoughts.is_empty()).then_some(full_thoughts.as_str());
                                    match self
                                        .store
                                        .update_message(&assistant_message_id, &full_text, thoughts, None)
                                        .await
                                    {
                                        Ok(()) => last_flush = Instant::now(),
                                        Err(e) => {
                                            error!(chat_id = %chat_id, "Error updating message in DB: {}", e)
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        // Clean end of stream
        self.set_state(chat_id, ChatState::Static).await;
        self.emit(WorkerEvent::content(chat_id, "complete", ""));

        let thoughts = (!full_thoughts.is_empty()).then_some(full_thoughts.as_str());
        if let Err(e) = self
            .store
            .update_message(&assistant_message_id, &full_text, thoughts, None)
            .await
        {
            error!(chat_id = %chat_id, "Final message flush failed: {}", e);
        }

        let actual_tokens = captured_usage
            .as_ref()
            .map(|usage| ContextManager::extract_actual_tokens(usage))
            .unwrap_or(0);
        if let Err(e) = self
            .store
            .save_token_usage(
                chat_id,
                Some(&assistant_message_id),
                "assistant",
                provider_name,
                model,
                estimated_tokens,
                actual_tokens,
            )
            .await
        {
            warn!(chat_id = %chat_id, "Failed to save token usage: {}", e);
        }

        self.done(chat_id, true, None);
        info!(chat_id = %chat_id, "Worker turn completed");
    }

    /// Hop through static so a retry can re-enter the thinking phase.
    async fn reset_state_for_retry(&self, chat_id: &str, use_reasoning: bool) -> ChatState {
        let state = if use_reasoning {
            ChatState::Thinking
        } else {
            ChatState::Responding
        };
        if let Err(e) = self.store.update_chat_state(chat_id, ChatState::Static).await {
            warn!(chat_id = %chat_id, "Failed to reset state for retry: {}", e);
        }
        self.set_state(chat_id, state).await;
        state
    }

    async fn emit_retry(
        &self,
        chat_id: &str,
        model: &str,
        retry: &RetryConfig,
        attempt: usize,
        error: &str,
    ) {
        let delay = retry.delay_for_attempt(attempt);
        warn!(
            chat_id = %chat_id,
            attempt,
            max_attempts = retry.max_attempts,
            "Worker stream retry: {}",
            error
        );
        let retry_event = RetryEvent::new(attempt, retry, delay, model, error);
        self.emit(
            WorkerEvent::content(chat_id, "model_retry", "").with_meta(
                "retry_data",
                serde_json::to_value(&retry_event).unwrap_or_default(),
            ),
        );
        tokio::time::sleep(delay).await;
    }

    /// A turn that failed before streaming: clean up and report.
    async fn fail_turn(&self, chat_id: &str, assistant_message_id: Option<&str>, error: &str) {
        error!(chat_id = %chat_id, "{}", error);
        if let Some(assistant_id) = assistant_message_id {
            if let Err(e) = self.store.cascade_delete_message(assistant_id, chat_id).await {
                warn!(chat_id = %chat_id, "Failed to remove placeholder: {}", e);
            }
        }
        self.set_state(chat_id, ChatState::Static).await;
        self.emit(WorkerEvent::content(chat_id, "error", error));
        self.done(chat_id, false, Some(error.to_string()));
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_domain_task(
        &self,
        commands: &mut CommandReader,
        chat_id: &str,
        domain_id: &str,
        message: &str,
        chat_history: Vec<HistoryMessage>,
        attached_file_ids: &[String],
        assistant_message_id: &str,
    ) {
        info!(chat_id = %chat_id, domain = %domain_id, "Worker domain execution");

        let mut workspace_path: Option<String> = None;
        if domain_id == "coder" {
            workspace_path = self.resolve_workspace(chat_id).await;
            if workspace_path.is_none() {
                info!(chat_id = %chat_id, "Waiting for workspace selection");
                if let Err(e) = self
                    .store
                    .update_message(assistant_message_id, WORKSPACE_PROMPT_MESSAGE, None, None)
                    .await
                {
                    warn!(chat_id = %chat_id, "Failed to persist workspace prompt: {}", e);
                }
                self.emit(WorkerEvent::content(
                    chat_id,
                    "coder_workspace_prompt",
                    json!({
                        "chat_id": chat_id,
                        "message": message,
                        "domain_id": domain_id,
                    })
                    .to_string(),
                ));
                self.emit(WorkerEvent::content(chat_id, "answer", WORKSPACE_PROMPT_MESSAGE));
                self.set_state(chat_id, ChatState::Thinking).await;

                // Block this worker until the workspace arrives or the
                // user cancels
                loop {
                    match read_frame::<_, WorkerCommand>(commands).await {
                        Ok(Some(WorkerCommand::WorkspaceSelected { .. })) => {
                            workspace_path = self.resolve_workspace(chat_id).await;
                            if workspace_path.is_some() {
                                info!(chat_id = %chat_id, "Workspace selected, resuming");
                                break;
                            }
                            warn!(chat_id = %chat_id, "Workspace still unavailable after selection");
                        }
                        Ok(Some(WorkerCommand::Cancel)) | Ok(Some(WorkerCommand::Stop)) => {
                            info!(chat_id = %chat_id, "Cancelled during workspace wait");
                            self.set_state(chat_id, ChatState::Static).await;
                            self.emit(WorkerEvent::content(chat_id, "complete", ""));
                            self.done(chat_id, true, None);
                            return;
                        }
                        Ok(Some(other)) => {
                            warn!(chat_id = %chat_id, "Ignoring command during workspace wait: {:?}", other);
                        }
                        Ok(None) | Err(_) => {
                            warn!(chat_id = %chat_id, "Pipe closed during workspace wait");
                            return;
                        }
                    }
                }
            }
        }

        self.set_state(chat_id, ChatState::Responding).await;

        let mut attached_files = Vec::new();
        for file_id in attached_file_ids {
            if let Ok(Some(record)) = self.store.get_file_record(file_id).await {
                attached_files.push(AttachedFile {
                    id: record.id,
                    name: record.original_name,
                });
            }
        }

        let callback = self.domain_callback(chat_id, workspace_path.clone());
        let request = DomainTaskRequest {
            domain_id: domain_id.to_string(),
            user_request: message.to_string(),
            chat_id: chat_id.to_string(),
            chat_history,
            attached_files,
            assistant_message_id: Some(assistant_message_id.to_string()),
            workspace_path,
        };

        match self.domains.execute_domain_task(request, callback).await {
            Ok(result) => {
                self.finish_domain_result(chat_id, &result, Some(assistant_message_id)).await;
                self.done(chat_id, result.error.is_none(), result.error.clone());
            }
            Err(e) => {
                let error_text = format!("Domain execution error: {e}");
                if let Err(db_err) = self
                    .store
                    .update_message(assistant_message_id, &error_text, None, None)
                    .await
                {
                    warn!(chat_id = %chat_id, "Failed to persist domain error: {}", db_err);
                }
                self.emit(WorkerEvent::content(chat_id, "error", error_text.clone()));
                self.set_state(chat_id, ChatState::Static).await;
                self.emit(WorkerEvent::content(chat_id, "complete", ""));
                self.done(chat_id, false, Some(error_text));
            }
        }
    }

    async fn handle_tool_decision(&self, decision: ToolDecisionRequest) {
        let chat_id = decision.chat_id.clone();
        let task_id = decision.task_id.clone();
        info!(chat_id = %chat_id, task_id = %task_id, decision = %decision.decision, "Worker handling tool decision");

        self.set_state(&chat_id, ChatState::Responding).await;

        let callback = self.domain_callback(&chat_id, None);
        let assistant_override = decision.assistant_message_id.clone();
        match self.domains.handle_tool_decision(decision, callback).await {
            Ok(result) => {
                let assistant_id = result
                    .assistant_message_id
                    .clone()
                    .or(assistant_override);
                if let Some(error) = &result.error {
                    error!(chat_id = %chat_id, "Tool decision error: {}", error);
                    self.set_state(&chat_id, ChatState::Static).await;
                    self.done(&chat_id, false, Some(error.clone()));
                } else {
                    self.finish_domain_result(&chat_id, &result, assistant_id.as_deref())
                        .await;
                    self.done(&chat_id, true, None);
                }
            }
            Err(e) => {
                error!(chat_id = %chat_id, "Failed to process tool decision: {}", e);
                self.set_state(&chat_id, ChatState::Static).await;
                self.done(&chat_id, false, Some(e.to_string()));
            }
        }
    }

    /// Worker-side twin of the engine's domain result handler.
    async fn finish_domain_result(
        &self,
        chat_id: &str,
        result: &DomainTaskResult,
        assistant_message_id: Option<&str>,
    ) {
        let status = result.status.to_lowercase();
        let domain_json = serde_json::to_string(result).unwrap_or_else(|_| "{}".to_string());

        self.emit(WorkerEvent::content(chat_id, "domain_execution", domain_json.clone()));

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

        if let Some(assistant_id) = assistant_message_id {
            let domain_execution = result.error.is_none().then_some(domain_json.as_str());
            if let Err(e) = self
                .store
                .update_message(assistant_id, &message_text, None, domain_execution)
                .await
            {
                error!(chat_id = %chat_id, "Failed to persist domain result: {}", e);
            }
        }

        if !message_text.is_empty() {
            self.emit(WorkerEvent::content(chat_id, "answer", message_text));
        }

        self.set_state(chat_id, ChatState::Static).await;
        if status == "waiting_user" {
            return;
        }
        if let Some(error) = &result.error {
            if !matches!(status.as_str(), "completed" | "failed" | "aborted") {
                self.emit(WorkerEvent::content(chat_id, "error", error.clone()));
                return;
            }
        }
        self.emit(WorkerEvent::content(chat_id, "complete", ""));
    }

    fn domain_callback(&self, chat_id: &str, workspace_path: Option<String>) -> DomainEventCallback {
        let events = self.events.clone();
        let chat_id = chat_id.to_string();

        Arc::new(move |event: DomainEvent| {
            let Some(payload) = event.payload.clone() else {
                return;
            };
            let task_id = event.task_id.clone();

            let worker_event = match event.event.as_str() {
                "state" => Some(
                    WorkerEvent::content(&chat_id, "domain_execution_update", payload.to_string())
                        .with_meta("task_id", json!(task_id)),
                ),
                "model_retry" => Some(
                    WorkerEvent::content(&chat_id, "model_retry", payload.to_string())
                        .with_meta("task_id", json!(task_id)),
                ),
                "tool_execution" => {
                    let operation = json!({
                        "task_id": task_id,
                        "domain_id": event.domain_id,
                        "operation": payload,
                        "workspace_path": workspace_path,
                    });
                    let _ = events.send(WorkerEvent::content(
                        &chat_id,
                        "coder_operation",
                        operation.to_string(),
                    ));
                    for raw in derive_file_change_events(&payload) {
                        let Some(file_path) = raw.get("file_path").and_then(|v| v.as_str()) else {
                            continue;
                        };
                        let detail = json!({
                            "chat_id": chat_id,
                            "workspace_path": workspace_path,
                            "file_path": file_path,
                            "operation": raw.get("operation").and_then(|v| v.as_str()).unwrap_or("edit"),
                            "content": raw.get("content"),
                            "previous_path": raw.get("previous_path"),
                        });
                        let _ = events.send(WorkerEvent::content(
                            &chat_id,
                            "coder_file_change",
                            detail.to_string(),
                        ));
                    }
                    None
                }
                "coder_stream" => Some(
                    WorkerEvent::content(&chat_id, "coder_stream", payload.to_string())
                        .with_meta("task_id", json!(task_id)),
                ),
                "coder_file_operation" | "coder_file_revert" => Some(
                    WorkerEvent::content(&chat_id, &event.event, "")
                        .with_meta("task_id", json!(task_id))
                        .with_meta("domain_id", json!(event.domain_id))
                        .with_meta("payload", payload),
                ),
                _ => None,
            };

            if let Some(worker_event) = worker_event {
                let _ = events.send(worker_event);
            }
        })
    }

    async fn resolve_workspace(&self, chat_id: &str) -> Option<String> {
        match self.store.get_coder_workspace(chat_id).await {
            Ok(Some(path)) if std::path::Path::new(&path).exists() => Some(path),
            Ok(Some(path)) => {
                warn!(chat_id = %chat_id, path = %path, "Workspace path missing on disk");
                None
            }
            Ok(None) => None,
            Err(e) => {
                error!(chat_id = %chat_id, "Failed to fetch workspace: {}", e);
                None
            }
        }
    }
}
