// src/api/chat.rs
// Chat endpoints: streaming turns, the global event stream, stop,
// history and enumeration

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures::Stream;
use serde_json::{json, Value};
use tracing::{error, info};

use super::sse::{
    data_frame, json_frame, retry_frame, SseResult, SubscriptionGuard, QUEUE_DRAIN_TIMEOUT,
    QUEUE_IDLE_GRACE, SSE_IDLE_TIMEOUT, TERMINAL_EVENT_POLL,
};
use crate::dispatch::{DispatchOutcome, StreamRequest};
use crate::engine::ToolDecisionRequest;
use crate::events::Event;
use crate::providers::{ChatStreamRequest, HistoryMessage, StreamChunk};
use crate::state::AppState;
use crate::store::{ChatState, SaveMessage};

fn keep_alive() -> KeepAlive {
    KeepAlive::new().interval(SSE_IDLE_TIMEOUT).text("keep-alive")
}

/// POST /api/chat/stream - start (or attach to) a streaming turn.
pub async fn stream_message(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> impl IntoResponse {
    let chat_id = match state.dispatcher.ensure_chat(request.chat_id.as_deref()).await {
        Ok(chat_id) => chat_id,
        Err(e) => {
            error!("Failed to resolve chat: {}", e);
            let stream = async_stream::stream! {
                yield json_frame(&json!({"type": "error", "content": e.to_string()}));
            };
            return Sse::new(boxed(stream)).keep_alive(keep_alive());
        }
    };

    let stream = async_stream::stream! {
        yield retry_frame();
        yield json_frame(&json!({"type": "chat_id", "content": chat_id}));

        // No message: the client is reattaching to an ongoing stream
        if request.message.is_none() && !request.is_edit_regeneration {
            if !state.dispatcher.is_processing(&chat_id) {
                yield json_frame(&json!({"type": "error", "content": "Message is required"}));
                return;
            }
            let current_state = state.store.get_chat_state(&chat_id).await.ok();
            for await frame in stream_content_queue(state.clone(), chat_id.clone(), current_state) {
                yield frame;
            }
            return;
        }

        match state.dispatcher.start_turn(&chat_id, &request).await {
            DispatchOutcome::Started => {
                for await frame in stream_content_queue(state.clone(), chat_id.clone(), None) {
                    yield frame;
                }
                if !state.dispatcher.is_processing(&chat_id) {
                    state.bus.cleanup_queue(&chat_id);
                }
                yield json_frame(&json!({"type": "complete"}));
            }
            DispatchOutcome::AlreadyProcessing => {
                info!(chat_id = %chat_id, "Attaching client to ongoing stream");
                let current_state = state.store.get_chat_state(&chat_id).await.ok();
                for await frame in stream_content_queue(state.clone(), chat_id.clone(), current_state) {
                    yield frame;
                }
            }
            DispatchOutcome::Duplicate => {
                yield json_frame(&json!({
                    "type": "error",
                    "content": "Duplicate message blocked - please wait before sending the same message again",
                }));
            }
            DispatchOutcome::Rejected(error) => {
                yield json_frame(&json!({"type": "error", "content": error}));
            }
        }
    };

    Sse::new(boxed(stream)).keep_alive(keep_alive())
}

fn boxed(
    stream: impl Stream<Item = SseResult> + Send + 'static,
) -> std::pin::Pin<Box<dyn Stream<Item = SseResult> + Send>> {
    Box::pin(stream)
}

/// Drain a chat's content queue into SSE frames. Terminal events are
/// held until the queue has drained so slow consumers keep ordering.
fn stream_content_queue(
    state: AppState,
    chat_id: String,
    initial_state: Option<ChatState>,
) -> impl Stream<Item = SseResult> {
    async_stream::stream! {
        if let Some(chat_state) = initial_state {
            yield data_frame(&Event::state(&chat_id, chat_state));
        }

        let queue = state.bus.content_queue(&chat_id);
        let mut terminal: Option<Event> = None;

        loop {
            let timeout = if terminal.is_some() {
                TERMINAL_EVENT_POLL
            } else {
                SSE_IDLE_TIMEOUT
            };

            match queue.pop(timeout).await {
                Some(event) if event.is_terminal() => {
                    terminal = Some(event);
                }
                Some(event) => {
                    yield data_frame(&event);
                }
                None => {
                    if let Some(event) = terminal.take() {
                        state
                            .bus
                            .wait_for_queue_drain(&chat_id, QUEUE_DRAIN_TIMEOUT, QUEUE_IDLE_GRACE)
                            .await;
                        yield data_frame(&event);
                        break;
                    }
                    if !state.dispatcher.is_processing(&chat_id) {
                        info!(chat_id = %chat_id, "Background processing finished while client connected");
                        break;
                    }
                }
            }
        }
    }
}

/// GET /api/chat/stream/all - the combined live stream for every chat.
pub async fn stream_all(State(state): State<AppState>) -> impl IntoResponse {
    let stream = async_stream::stream! {
        let subscription = state.bus.subscribe();
        let _guard = SubscriptionGuard::new(state.bus.clone(), subscription.id);
        let mut rx = subscription.rx;

        yield Ok(axum::response::sse::Event::default().event("ping").data("{}"));

        // Replay the state of chats still mid-turn so reconnecting
        // clients resynchronize
        if let Ok(chats) = state.store.get_all_chats().await {
            for chat in chats {
                if chat.state != "static" {
                    if let Some(chat_state) = ChatState::parse(&chat.state) {
                        yield data_frame(&Event::state(&chat.id, chat_state));
                    }
                }
            }
        }

        while let Some(event) = rx.recv().await {
            yield data_frame(&event);
        }
    };

    Sse::new(boxed(stream)).keep_alive(keep_alive())
}

/// GET /api/chat/state/stream - chat state changes only.
pub async fn state_stream(State(state): State<AppState>) -> impl IntoResponse {
    let stream = async_stream::stream! {
        let subscription = state.bus.subscribe();
        let _guard = SubscriptionGuard::new(state.bus.clone(), subscription.id);
        let mut rx = subscription.rx;

        yield Ok(axum::response::sse::Event::default().retry(std::time::Duration::from_millis(1_000)));

        while let Some(event) = rx.recv().await {
            if event.event_type == "chat_state" {
                yield data_frame(&event);
            }
        }
    };

    Sse::new(boxed(stream)).keep_alive(keep_alive())
}

/// POST /api/chat/send - non-streaming request/response turn.
pub async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let Some(message) = body.get("message").and_then(|v| v.as_str()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Message is required"})),
        );
    };
    let provider_name = body
        .get("provider")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.chat.default_provider)
        .to_string();
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(&state.config.chat.default_model)
        .to_string();
    let include_reasoning = body
        .get("include_reasoning")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let attached_file_ids: Vec<String> = body
        .get("attached_file_ids")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let chat_id = match state
        .dispatcher
        .ensure_chat(body.get("chat_id").and_then(|v| v.as_str()))
        .await
    {
        Ok(chat_id) => chat_id,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    };

    match generate_once(
        &state,
        &chat_id,
        message,
        &provider_name,
        &model,
        include_reasoning,
        &attached_file_ids,
    )
    .await
    {
        Ok(response) => (
            StatusCode::OK,
            Json(json!({"chat_id": chat_id, "response": response})),
        ),
        Err(e) => {
            error!(chat_id = %chat_id, "send_message failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

/// Collect a full provider stream into one response without touching
/// chat state or the event bus.
async fn generate_once(
    state: &AppState,
    chat_id: &str,
    message: &str,
    provider_name: &str,
    model: &str,
    include_reasoning: bool,
    attached_file_ids: &[String],
) -> anyhow::Result<Value> {
    use futures_util::StreamExt;

    let provider = state
        .providers
        .get(provider_name)
        .filter(|p| p.is_available())
        .ok_or_else(|| anyhow::anyhow!("Provider '{provider_name}' not available"))?;

    state
        .store
        .save_message(
            chat_id,
            SaveMessage {
                attached_file_ids: attached_file_ids.to_vec(),
                ..SaveMessage::user(message)
            },
        )
        .await?;

    let mut history = state.store.get_chat_history(chat_id).await?;
    if history.last().map(|m| m.role == "user").unwrap_or(false) {
        history.pop();
    }
    let chat_history: Vec<HistoryMessage> = history
        .into_iter()
        .map(|m| HistoryMessage {
            role: m.role,
            content: m.content,
        })
        .collect();

    let use_reasoning = include_reasoning && provider.supports_reasoning(model);
    let mut stream = provider
        .stream_chat(ChatStreamRequest {
            message: message.to_string(),
            model: model.to_string(),
            include_thoughts: use_reasoning,
            system_prompt: state.store.get_chat_system_prompt(chat_id).await?,
            chat_history,
            file_attachments: state
                .store
                .resolve_api_file_names(
                    attached_file_ids,
                    provider_name,
                    &state.config.chat.default_provider,
                )
                .await?,
        })
        .await?;

    let mut text = String::new();
    let mut thoughts = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            StreamChunk::Answer { content } => text.push_str(&content),
            StreamChunk::Thoughts { content } => thoughts.push_str(&content),
            _ => {}
        }
    }

    if !text.is_empty() {
        state
            .store
            .save_message(
                chat_id,
                SaveMessage {
                    thoughts: (!thoughts.is_empty()).then(|| thoughts.clone()),
                    provider: Some(provider_name.to_string()),
                    model: Some(model.to_string()),
                    ..SaveMessage::assistant(text.clone())
                },
            )
            .await?;
    }

    Ok(json!({
        "text": text,
        "thoughts": (!thoughts.is_empty()).then_some(thoughts),
    }))
}

/// POST /api/chat/{chat_id}/stop
pub async fn stop_chat(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    match state.store.chat_exists(&chat_id).await {
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Chat not found"})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
        Ok(true) => {
            let stopped = state.dispatcher.stop_chat(&chat_id);
            if stopped {
                (StatusCode::OK, Json(json!({"success": true, "chat_id": chat_id})))
            } else {
                (
                    StatusCode::OK,
                    Json(json!({
                        "success": false,
                        "chat_id": chat_id,
                        "message": "No active stream to stop",
                    })),
                )
            }
        }
    }
}

/// GET /api/chat/history/{chat_id}
pub async fn chat_history(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_chat_history(&chat_id).await {
        Ok(history) => (
            StatusCode::OK,
            Json(json!({"chat_id": chat_id, "history": history})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        ),
    }
}

/// GET /api/chat/providers
pub async fn list_providers(State(state): State<AppState>) -> impl IntoResponse {
    let availability = state.providers.availability();
    let providers: Value = availability
        .into_iter()
        .map(|(name, available)| (name, json!({"available": available})))
        .collect::<serde_json::Map<String, Value>>()
        .into();

    Json(json!({
        "providers": providers,
        "default_provider": state.config.chat.default_provider,
    }))
}

/// GET /api/chat/models
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "models": state.providers.all_models(),
        "default_model": state.config.chat.default_model,
    }))
}

/// POST /api/chats/{chat_id}/domain/{task_id}/tool/{call_id}/decision
pub async fn domain_tool_decision(
    State(state): State<AppState>,
    Path((chat_id, task_id, call_id)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let decision = body
        .get("decision")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_lowercase();
    if !matches!(decision.as_str(), "accept" | "reject") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": "decision must be 'accept' or 'reject'"})),
        );
    }

    let request = ToolDecisionRequest {
        chat_id,
        task_id,
        call_id,
        decision,
        assistant_message_id: body
            .get("assistant_message_id")
            .and_then(|v| v.as_str())
            .map(String::from),
        batch_mode: body.get("batch_mode").and_then(|v| v.as_bool()).unwrap_or(true),
        pre_executed_calls: body
            .get("pre_executed_calls")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
        pre_execution_state: body
            .get("pre_execution_state")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default(),
    };

    let response = state.dispatcher.send_domain_tool_decision(request).await;
    let status = if response.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(response))
}

/// POST /api/chats/{chat_id}/workspace_selected
pub async fn workspace_selected(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    let response = state.dispatcher.workspace_selected(&chat_id).await;
    let status = if response.get("success").and_then(|v| v.as_bool()).unwrap_or(false) {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(response))
}
