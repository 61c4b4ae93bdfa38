// src/engine/stream_task.rs
// One streaming chat turn: provider stream with retry, throttled
// persistence, usage finalization, stop/cancel handling

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::domain::execute_domain_turn;
use super::retry::{RetryConfig, RetryEvent};
use super::{AsyncEngine, StopKind, StreamTurnParams};
use crate::context::ContextManager;
use crate::events::Event;
use crate::providers::{ChatStreamRequest, HistoryMessage, StreamChunk};
use crate::router::fastpath::{parse_fastpath_params, wrap_fastpath_output};
use crate::store::{ChatState, SaveMessage};
use crate::tools::format_tool_output;

#[derive(Default)]
struct Accumulated {
    full_text: String,
    full_thoughts: String,
    assistant_message_id: Option<String>,
}

/// Entry point for a turn submitted to the scheduler. Wraps the turn
/// body in a cancellation race; the stop flag decides whether partial
/// content survives.
pub(crate) async fn execute_streaming(
    engine: Arc<AsyncEngine>,
    params: StreamTurnParams,
    cancel: CancellationToken,
) {
    let acc = Arc::new(Mutex::new(Accumulated::default()));

    tokio::select! {
        _ = cancel.cancelled() => {
            handle_cancellation(&engine, &params, &acc).await;
        }
        _ = run_turn(&engine, &params, &acc) => {}
    }
}

async fn handle_cancellation(
    engine: &Arc<AsyncEngine>,
    params: &StreamTurnParams,
    acc: &Arc<Mutex<Accumulated>>,
) {
    let chat_id = &params.chat_id;
    let kind = engine.take_stop_kind(chat_id);
    let (full_text, full_thoughts, assistant_id) = {
        let acc = acc.lock();
        (
            acc.full_text.clone(),
            acc.full_thoughts.clone(),
            acc.assistant_message_id.clone(),
        )
    };

    match kind {
        StopKind::Stop => {
            info!(chat_id = %chat_id, "Async task stopped, saving partial content");
            if let Some(assistant_id) = assistant_id {
                if !full_text.is_empty() || !full_thoughts.is_empty() {
                    let thoughts = (!full_thoughts.is_empty()).then_some(full_thoughts.as_str());
                    if let Err(e) = engine
                        .ctx()
                        .store
                        .update_message(&assistant_id, &full_text, thoughts, None)
                        .await
                    {
                        error!(chat_id = %chat_id, "Failed to save partial content: {}", e);
                    } else {
                        info!(
                            chat_id = %chat_id,
                            text_chars = full_text.len(),
                            thought_chars = full_thoughts.len(),
                            "Saved partial content"
                        );
                    }
                }
            }
        }
        StopKind::Cancel => {
            info!(
                chat_id = %chat_id,
                discarded_chars = full_text.len(),
                "Async task cancelled, discarding partial content"
            );
        }
    }

    engine.set_chat_static(chat_id).await;
    engine.ctx().bus.publish_content(chat_id, "complete", "");
}

async fn run_turn(
    engine: &Arc<AsyncEngine>,
    params: &StreamTurnParams,
    acc: &Arc<Mutex<Accumulated>>,
) {
    let ctx = engine.ctx().clone();
    let chat_id = params.chat_id.clone();

    info!(
        chat_id = %chat_id,
        provider = %params.provider,
        model = %params.model,
        include_reasoning = params.include_reasoning,
        "Starting async execution"
    );

    // Provider resolution happens before any state change so a bad
    // request leaves the chat untouched
    let Some(provider) = ctx.providers.get(&params.provider) else {
        let message = format!("Provider '{}' not found", params.provider);
        error!(chat_id = %chat_id, "{}", message);
        ctx.bus.publish_content(&chat_id, "error", &message);
        return;
    };
    if !provider.is_available() {
        let message = format!("Provider '{}' not available", params.provider);
        error!(chat_id = %chat_id, "{}", message);
        ctx.bus.publish_content(&chat_id, "error", &message);
        return;
    }

    let mut chat_history = match ctx.store.get_chat_history(&chat_id).await {
        Ok(history) => history,
        Err(e) => {
            error!(chat_id = %chat_id, "Failed to load history: {}", e);
            ctx.bus
                .publish_content(&chat_id, "error", &format!("Failed to load history: {e}"));
            return;
        }
    };
    // The current user message is passed separately
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

    let system_prompt = ctx
        .store
        .get_chat_system_prompt(&chat_id)
        .await
        .unwrap_or_default();

    let file_attachments = ctx
        .store
        .resolve_api_file_names(
            &params.attached_file_ids,
            &params.provider,
            &ctx.chat.default_provider,
        )
        .await
        .unwrap_or_default();

    let router_decision_json = params
        .router_decision
        .as_ref()
        .map(|d| persisted_router_json(d));

    // Domain routes leave the plain streaming path entirely
    if let Some(decision) = params
        .router_decision
        .as_ref()
        .filter(|d| d.is_domain_execution())
    {
        let domain_id = decision.domain_id.clone().unwrap_or_default();
        execute_domain_turn(
            engine,
            &chat_id,
            &domain_id,
            &params.message,
            history,
            &params.attached_file_ids,
            &params.provider,
            &params.model,
            params.include_reasoning,
            &params.user_message_id,
            router_decision_json,
        )
        .await;
        return;
    }

    let mut current_state = if params.include_reasoning {
        ChatState::Thinking
    } else {
        ChatState::Responding
    };
    if let Err(e) = ctx.store.update_chat_state(&chat_id, current_state).await {
        warn!(chat_id = %chat_id, "Failed to set initial state: {}", e);
    }
    ctx.bus.publish_state(&chat_id, current_state);

    let mut answer_started = false;

    // Placeholder so streaming updates have a target and router metadata
    // survives reloads
    let assistant_message_id = match ctx
        .store
        .save_message(
            &chat_id,
            SaveMessage {
                provider: Some(params.provider.clone()),
                model: Some(params.model.clone()),
                router_enabled: params.router_decision.is_some(),
                router_decision: router_decision_json.clone(),
                ..SaveMessage::assistant("")
            },
        )
        .await
    {
        Ok(id) => {
            acc.lock().assistant_message_id = Some(id.clone());
            if let Err(e) = ctx.store.record_version_assistant_lineage(&chat_id, &id).await {
                debug!(chat_id = %chat_id, "Failed to record assistant lineage: {}", e);
            }
            ctx.bus.publish_event(
                Event::content(
                    &chat_id,
                    "message_ids",
                    json!({
                        "user_message_id": params.user_message_id,
                        "assistant_message_id": id,
                    })
                    .to_string(),
                ),
            );
            Some(id)
        }
        Err(e) => {
            warn!(chat_id = %chat_id, "Failed to pre-create assistant message: {}", e);
            None
        }
    };

    // Without a reasoning phase the answer stream starts immediately;
    // message_ids has already gone out so content may follow
    if !params.include_reasoning {
        ctx.bus.publish_content(&chat_id, "answer_start", "");
        answer_started = true;
    }

    // FastPath: run the router-selected tool now and hand its output to
    // the model alongside the query
    let mut message = params.message.clone();
    if let Some(fastpath) = params
        .router_decision
        .as_ref()
        .and_then(|d| d.fastpath_params.as_deref())
    {
        if let Some(call) = parse_fastpath_params(fastpath) {
            let ctx_id = format!("fastpath_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
            let output = match ctx.tools.execute(&call.tool, &call.params, &ctx_id).await {
                Ok(output) => Some(format_tool_output(&call.tool, &output)),
                Err(e) => {
                    error!(chat_id = %chat_id, tool = %call.tool, "FastPath tool failed: {}", e);
                    Some(format!(
                        "[TOOL EXECUTION ERROR] The {} tool failed with error: {e}",
                        call.tool
                    ))
                }
            };
            if let Some(output) = output {
                message = wrap_fastpath_output(&output, &message);
                info!(chat_id = %chat_id, tool = %call.tool, "Prepended FastPath tool output");
            }
        }
    }

    let request = ChatStreamRequest {
        message,
        model: params.model.clone(),
        include_thoughts: params.include_reasoning,
        system_prompt,
        chat_history: history,
        file_attachments,
    };

    // Retry-wrapped stream loop
    let retry = ctx.retry.clone();
    let throttle = Duration::from_millis(ctx.chat.db_update_throttle_ms);
    let mut last_flush = Instant::now();
    let mut captured_usage: Option<Value> = None;
    let mut attempt: usize = 0;

    'attempts: loop {
        let mut stream = match provider.stream_chat(request.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                if e.is_retryable() && attempt + 1 < retry.max_attempts {
                    attempt += 1;
                    backoff(engine, params, acc, &retry, attempt, &e.to_string()).await;
                    captured_usage = None;
                    answer_started = false;
                    current_state = reset_state_for_retry(engine, params).await;
                    continue 'attempts;
                }
                error!(chat_id = %chat_id, attempts = attempt + 1, "Giving up on provider stream: {}", e);
                engine.set_chat_static(&chat_id).await;
                ctx.bus.publish_content(&chat_id, "error", &e.to_string());
                return;
            }
        };

        loop {
            match stream.next().await {
                None => break 'attempts,
                Some(Err(e)) => {
                    if e.is_retryable() && attempt + 1 < retry.max_attempts {
                        attempt += 1;
                        backoff(engine, params, acc, &retry, attempt, &e.to_string()).await;
                        captured_usage = None;
                        answer_started = false;
                        current_state = reset_state_for_retry(engine, params).await;
                        continue 'attempts;
                    }
                    error!(chat_id = %chat_id, attempts = attempt + 1, "Giving up on provider stream: {}", e);
                    engine.set_chat_static(&chat_id).await;
                    ctx.bus.publish_content(&chat_id, "error", &e.to_string());
                    return;
                }
                Some(Ok(chunk)) => {
                    match chunk {
                        StreamChunk::ThoughtsStart => {
                            ctx.bus.publish_content(&chat_id, "thoughts_start", "");
                        }
                        StreamChunk::Thoughts { content } => {
                            acc.lock().full_thoughts.push_str(&content);
                            ctx.bus.publish_content(&chat_id, "thoughts", &content);
                        }
                        StreamChunk::AnswerStart => {
                            if current_state == ChatState::Thinking {
                                current_state =
                                    transition_to_responding(engine, &chat_id).await;
                            }
                            if !answer_started {
                                ctx.bus.publish_content(&chat_id, "answer_start", "");
                                answer_started = true;
                            }
                        }
                        StreamChunk::Answer { content } => {
                            acc.lock().full_text.push_str(&content);
                            if !answer_started {
                                if current_state == ChatState::Thinking {
                                    current_state =
                                        transition_to_responding(engine, &chat_id).await;
                                }
                                ctx.bus.publish_content(&chat_id, "answer_start", "");
                                answer_started = true;
                            }
                            ctx.bus.publish_content(&chat_id, "answer", &content);
                        }
                        StreamChunk::Usage { usage } => {
                            captured_usage = Some(usage.clone());
                            ctx.bus.publish_event(
                                Event::content(&chat_id, "usage", "").with_meta("usage", usage),
                            );
                        }
                    }

                    // Throttled persistence keeps write amplification down
                    if last_flush.elapsed() >= throttle {
                        if flush_accumulated(engine, acc).await {
                            last_flush = Instant::now();
                        }
                    }
                }
            }
        }
    }

    let (full_text, full_thoughts) = {
        let acc = acc.lock();
        (acc.full_text.clone(), acc.full_thoughts.clone())
    };
    if full_text.is_empty() && full_thoughts.is_empty() {
        warn!(chat_id = %chat_id, "Streaming completed with no content");
    }

    // Final forced flush
    let thoughts = (!full_thoughts.is_empty()).then_some(full_thoughts.as_str());
    match &assistant_message_id {
        Some(id) => {
            if let Err(e) = ctx.store.update_message(id, &full_text, thoughts, None).await {
                error!(chat_id = %chat_id, "Final message flush failed: {}", e);
            }
        }
        None => {
            // Placeholder creation failed earlier; persist the turn now
            if let Err(e) = ctx
                .store
                .save_message(
                    &chat_id,
                    SaveMessage {
                        thoughts: thoughts.map(String::from),
                        provider: Some(params.provider.clone()),
                        model: Some(params.model.clone()),
                        router_enabled: params.router_decision.is_some(),
                        router_decision: router_decision_json,
                        ..SaveMessage::assistant(full_text.clone())
                    },
                )
                .await
            {
                error!(chat_id = %chat_id, "Failed to save assistant message: {}", e);
            }
        }
    }

    // Reconcile the rate-limit reservation against provider-reported
    // usage and persist the accounting row
    let mut actual_tokens = 0;
    if let Some(usage) = &captured_usage {
        actual_tokens = ContextManager::extract_actual_tokens(usage);
        if actual_tokens > 0 {
            ctx.limiter
                .finalize_tokens(&params.provider, &params.model, actual_tokens);
        } else {
            warn!(chat_id = %chat_id, "Could not extract token count from usage data");
        }
    }
    if actual_tokens > 0 || params.estimated_tokens > 0 {
        if let Err(e) = ctx
            .store
            .save_token_usage(
                &chat_id,
                assistant_message_id.as_deref(),
                "assistant",
                &params.provider,
                &params.model,
                params.estimated_tokens,
                actual_tokens,
            )
            .await
        {
            warn!(chat_id = %chat_id, "Failed to save token usage: {}", e);
        }
    }

    engine.set_chat_static(&chat_id).await;
    ctx.bus.publish_content(&chat_id, "complete", "");
    info!(chat_id = %chat_id, "Completed async execution");
}

async fn backoff(
    engine: &Arc<AsyncEngine>,
    params: &StreamTurnParams,
    acc: &Arc<Mutex<Accumulated>>,
    retry: &RetryConfig,
    attempt: usize,
    error: &str,
) {
    let delay = retry.delay_for_attempt(attempt);
    warn!(
        chat_id = %params.chat_id,
        attempt,
        max_attempts = retry.max_attempts,
        delay_secs = delay.as_secs_f64(),
        "Provider stream retry: {}",
        error
    );

    let retry_event = RetryEvent::new(attempt, retry, delay, &params.model, error);
    engine.ctx().bus.publish_event(
        Event::content(&params.chat_id, "model_retry", "")
            .with_meta("retry_data", serde_json::to_value(&retry_event).unwrap_or_default()),
    );

    // A fresh attempt starts from scratch
    {
        let mut acc = acc.lock();
        acc.full_text.clear();
        acc.full_thoughts.clear();
    }

    tokio::time::sleep(delay).await;
}

async fn reset_state_for_retry(engine: &Arc<AsyncEngine>, params: &StreamTurnParams) -> ChatState {
    let state = if params.include_reasoning {
        ChatState::Thinking
    } else {
        ChatState::Responding
    };
    // A fresh attempt restarts the lifecycle; hop through static so the
    // thinking phase is reachable again from responding
    let store = &engine.ctx().store;
    if let Err(e) = store.update_chat_state(&params.chat_id, ChatState::Static).await {
        warn!(chat_id = %params.chat_id, "Failed to reset state for retry: {}", e);
    }
    if let Err(e) = store.update_chat_state(&params.chat_id, state).await {
        warn!(chat_id = %params.chat_id, "Failed to reset state for retry: {}", e);
    }
    engine.ctx().bus.publish_state(&params.chat_id, state);
    state
}

async fn transition_to_responding(engine: &Arc<AsyncEngine>, chat_id: &str) -> ChatState {
    if let Err(e) = engine
        .ctx()
        .store
        .update_chat_state(chat_id, ChatState::Responding)
        .await
    {
        warn!(chat_id = %chat_id, "Failed to update state to responding: {}", e);
    }
    engine.ctx().bus.publish_state(chat_id, ChatState::Responding);
    ChatState::Responding
}

/// Throttled mid-stream flush; persistence failures never interrupt the
/// stream.
async fn flush_accumulated(engine: &Arc<AsyncEngine>, acc: &Arc<Mutex<Accumulated>>) -> bool {
    let (full_text, full_thoughts, assistant_id) = {
        let acc = acc.lock();
        (
            acc.full_text.clone(),
            acc.full_thoughts.clone(),
            acc.assistant_message_id.clone(),
        )
    };
    let Some(assistant_id) = assistant_id else {
        return false;
    };
    if full_text.is_empty() && full_thoughts.is_empty() {
        return false;
    }

    let thoughts = (!full_thoughts.is_empty()).then_some(full_thoughts.as_str());
    if let Err(e) = engine
        .ctx()
        .store
        .update_message(&assistant_id, &full_text, thoughts, None)
        .await
    {
        error!("Error updating message during stream: {}", e);
        return false;
    }
    true
}

/// Router metadata in the shape persisted on messages.
pub(crate) fn persisted_router_json(decision: &crate::router::RouterDecision) -> String {
    json!({
        "route": decision.route,
        "available_routes": decision.available_routes,
        "selected_model": decision.model,
        "selected_provider": decision.provider,
        "tools_needed": decision.tools_needed,
        "execution_type": decision.execution_type,
        "domain_id": decision.domain_id,
        "fastpath_params": decision.fastpath_params,
        "error": decision.error,
    })
    .to_string()
}
