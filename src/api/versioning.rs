// src/api/versioning.rs
// Versioning endpoints: branch creation and version lookups

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::{error, info};

use crate::state::AppState;
use crate::versioning::VersionOperationRequest;

/// POST /api/db/versioning/notify
pub async fn versioning_notify(
    State(state): State<AppState>,
    Json(request): Json<VersionOperationRequest>,
) -> impl IntoResponse {
    info!(
        operation = %request.operation_type,
        message_id = %request.message_id,
        chat_id = %request.chat_id,
        "Versioning notification"
    );

    match state.versioning.apply_operation(&request).await {
        Ok(result) => (StatusCode::OK, Json(serde_json::to_value(result).unwrap_or_default())),
        Err(e) => {
            error!("Versioning operation failed: {}", e);
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

/// GET /api/db/chat/{chat_id}/versions
pub async fn chat_versions(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> impl IntoResponse {
    match state.versioning.get_chat_versions(&chat_id).await {
        Ok(tree) => (StatusCode::OK, Json(tree)),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}

/// GET /api/messages/{message_id}/versions
pub async fn message_versions(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
) -> impl IntoResponse {
    match state.versioning.get_message_versions(&message_id).await {
        Ok(response) => (
            StatusCode::OK,
            Json(serde_json::to_value(response).unwrap_or_default()),
        ),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": e.to_string()})),
        ),
    }
}
