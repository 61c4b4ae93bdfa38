// src/api/terminal.rs
// Terminal endpoints: session lifecycle, input, and SSE output

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::error;

use crate::state::AppState;
use crate::terminal::TerminalEvent;

#[derive(Deserialize)]
pub struct CreateTerminalRequest {
    pub chat_id: String,
}

/// POST /api/terminal/create
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateTerminalRequest>,
) -> impl IntoResponse {
    match state.terminals.create(&request.chat_id).await {
        Ok(session) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "session_id": session.session_id,
                "workspace_path": session.workspace_path,
            })),
        ),
        Err(e) => {
            error!(chat_id = %request.chat_id, "Terminal create failed: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

#[derive(Deserialize)]
pub struct SendInputRequest {
    pub session_id: String,
    pub data: String,
}

/// POST /api/terminal/send
pub async fn send_input(
    State(state): State<AppState>,
    Json(request): Json<SendInputRequest>,
) -> impl IntoResponse {
    match state.terminals.send(&request.session_id, request.data.as_bytes()) {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
pub struct ResizeRequest {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

/// POST /api/terminal/resize
pub async fn resize_session(
    State(state): State<AppState>,
    Json(request): Json<ResizeRequest>,
) -> impl IntoResponse {
    match state
        .terminals
        .resize(&request.session_id, request.cols, request.rows)
    {
        Ok(()) => (StatusCode::OK, Json(json!({"success": true}))),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

#[derive(Deserialize)]
pub struct KillRequest {
    pub session_id: String,
}

/// POST /api/terminal/kill
pub async fn kill_session(
    State(state): State<AppState>,
    Json(request): Json<KillRequest>,
) -> impl IntoResponse {
    let killed = state.terminals.kill(&request.session_id);
    Json(json!({"success": killed}))
}

/// GET /api/terminal/list
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({"sessions": state.terminals.list()}))
}

#[derive(Deserialize)]
pub struct OutputQuery {
    #[serde(default)]
    pub cursor: usize,
}

/// GET /api/terminal/output/{session_id}?cursor=N
pub async fn get_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<OutputQuery>,
) -> impl IntoResponse {
    match state.terminals.get(&session_id) {
        Some(session) => {
            let (output, cursor) = session.output_since(query.cursor);
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "output": output,
                    "cursor": cursor,
                    "running": session.is_running(),
                })),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": "session not found"})),
        ),
    }
}

/// GET /api/terminal/stream/{session_id} - live output over SSE.
pub async fn stream_output(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    let session = state.terminals.get(&session_id);

    let stream = async_stream::stream! {
        let Some(session) = session else {
            yield Ok::<_, std::convert::Infallible>(
                SseEvent::default().data(json!({"type": "error", "content": "session not found"}).to_string()),
            );
            return;
        };

        // Replay what already happened, then follow live output
        let (backlog, _) = session.output_since(0);
        if !backlog.is_empty() {
            let frame = TerminalEvent::Output { data: backlog };
            yield Ok(SseEvent::default().data(serde_json::to_string(&frame).unwrap_or_default()));
        }

        let mut rx = session.subscribe();
        while let Some(event) = rx.recv().await {
            let closed = matches!(event, TerminalEvent::Closed);
            yield Ok(SseEvent::default().data(serde_json::to_string(&event).unwrap_or_default()));
            if closed {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}
