// src/api/sse.rs
// SSE plumbing shared by the chat endpoints

use axum::response::sse::Event as SseEvent;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::events::{Event, EventBus};

pub const SSE_RETRY_MS: u64 = 1_500;
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const TERMINAL_EVENT_POLL: Duration = Duration::from_millis(100);
pub const QUEUE_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
pub const QUEUE_IDLE_GRACE: Duration = Duration::from_millis(50);

pub type SseResult = Result<SseEvent, Infallible>;

/// One `data: <json>` frame.
pub fn data_frame(event: &Event) -> SseResult {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Ok(SseEvent::default().data(json))
}

pub fn json_frame(value: &serde_json::Value) -> SseResult {
    Ok(SseEvent::default().data(value.to_string()))
}

/// The opening frame hinting the client reconnect delay.
pub fn retry_frame() -> SseResult {
    Ok(SseEvent::default().retry(Duration::from_millis(SSE_RETRY_MS)))
}

/// Unsubscribes the global-stream subscriber when the SSE generator is
/// dropped (client disconnect included).
pub struct SubscriptionGuard {
    bus: Arc<EventBus>,
    id: u64,
}

impl SubscriptionGuard {
    pub fn new(bus: Arc<EventBus>, id: u64) -> Self {
        Self { bus, id }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}
