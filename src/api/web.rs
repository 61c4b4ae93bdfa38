// src/api/web.rs
// Web session endpoints: profile status, session control, frame capture

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /api/web/profile/status
pub async fn profile_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.web.profile_status())
}

/// POST /api/web/profile/setup
pub async fn profile_setup(State(_state): State<AppState>) -> impl IntoResponse {
    // Profile provisioning runs outside the execution core
    (
        StatusCode::OK,
        Json(json!({
            "success": false,
            "error": "profile setup is not available in this deployment",
        })),
    )
}

/// GET /api/web/session/status
pub async fn session_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.web.get_status().await {
        Some(snapshot) => Json(json!({"active": true, "session": snapshot})),
        None => Json(json!({"active": false})),
    }
}

/// POST /api/web/session/ensure
pub async fn ensure_session(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let profile = body.get("profile").and_then(|v| v.as_str());
    let chat_id = body.get("chat_id").and_then(|v| v.as_str());
    let snapshot = state.web.ensure_session(profile, chat_id).await;
    Json(json!({"success": true, "session": snapshot}))
}

/// POST /api/web/session/{session_id}/command
pub async fn dispatch_command(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    match state.web.dispatch_command(&session_id, &payload).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({"success": true, "session": snapshot})),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

/// GET /api/web/session/{session_id}/frame - one JPEG frame.
pub async fn capture_frame(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.web.capture_frame(&session_id).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "image/jpeg")],
            bytes,
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "error": e.to_string()})),
        )
            .into_response(),
    }
}
