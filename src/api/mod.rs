// src/api/mod.rs
// HTTP surface: axum router wiring for chat, versioning, terminal, web

pub mod chat;
pub mod sse;
pub mod terminal;
pub mod versioning;
pub mod web;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Chat
        .route("/api/chat/stream", post(chat::stream_message))
        .route("/api/chat/send", post(chat::send_message))
        .route("/api/chat/stream/all", get(chat::stream_all))
        .route("/api/chat/state/stream", get(chat::state_stream))
        .route("/api/chat/{chat_id}/stop", post(chat::stop_chat))
        .route("/api/chat/history/{chat_id}", get(chat::chat_history))
        .route("/api/chat/providers", get(chat::list_providers))
        .route("/api/chat/models", get(chat::list_models))
        .route(
            "/api/chats/{chat_id}/domain/{task_id}/tool/{call_id}/decision",
            post(chat::domain_tool_decision),
        )
        .route(
            "/api/chats/{chat_id}/workspace_selected",
            post(chat::workspace_selected),
        )
        // Versioning
        .route("/api/db/versioning/notify", post(versioning::versioning_notify))
        .route("/api/db/chat/{chat_id}/versions", get(versioning::chat_versions))
        .route("/api/messages/{message_id}/versions", get(versioning::message_versions))
        // Terminal
        .route("/api/terminal/create", post(terminal::create_session))
        .route("/api/terminal/send", post(terminal::send_input))
        .route("/api/terminal/resize", post(terminal::resize_session))
        .route("/api/terminal/kill", post(terminal::kill_session))
        .route("/api/terminal/list", get(terminal::list_sessions))
        .route("/api/terminal/output/{session_id}", get(terminal::get_output))
        .route("/api/terminal/stream/{session_id}", get(terminal::stream_output))
        // Web session
        .route("/api/web/profile/status", get(web::profile_status))
        .route("/api/web/profile/setup", post(web::profile_setup))
        .route("/api/web/session/status", get(web::session_status))
        .route("/api/web/session/ensure", post(web::ensure_session))
        .route("/api/web/session/{session_id}/command", post(web::dispatch_command))
        .route("/api/web/session/{session_id}/frame", get(web::capture_frame))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
