// src/events/mod.rs
// Process-wide event bus: per-chat content queues, global subscribers,
// and a bounded replay backlog for late-joining clients

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::store::ChatState;

pub const BACKLOG_EVENT_LIMIT: usize = 500;
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 512;
const QUEUE_DRAIN_POLL: Duration = Duration::from_millis(10);

/// One envelope on the bus. `metadata` carries event-specific fields
/// (`state`, `usage`, `retry_data`, `task_id`, `domain_id`, `payload`, ...)
/// which consumers must treat as opaque when unrecognized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, Value>,
}

impl Event {
    pub fn content(chat_id: &str, event_type: &str, content: impl Into<String>) -> Self {
        Self {
            chat_id: Some(chat_id.to_string()),
            event_type: event_type.to_string(),
            content: Some(content.into()),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn state(chat_id: &str, state: ChatState) -> Self {
        let mut event = Self {
            chat_id: Some(chat_id.to_string()),
            event_type: "chat_state".to_string(),
            content: None,
            metadata: serde_json::Map::new(),
        };
        event
            .metadata
            .insert("state".to_string(), Value::String(state.as_str().to_string()));
        event
    }

    pub fn global(event_type: &str) -> Self {
        Self {
            chat_id: None,
            event_type: event_type.to_string(),
            content: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        if !value.is_null() {
            self.metadata.insert(key.to_string(), value);
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type.as_str(), "complete" | "error")
    }
}

/// Unbounded per-chat queue drained by the turn's SSE response.
#[derive(Default)]
pub struct ChatQueue {
    items: Mutex<VecDeque<Event>>,
    notify: Notify,
}

impl ChatQueue {
    pub fn push(&self, event: Event) {
        self.items.lock().push_back(event);
        self.notify.notify_waiters();
    }

    pub fn try_pop(&self) -> Option<Event> {
        self.items.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Pop the next event, waiting up to `timeout`.
    pub async fn pop(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register the waiter before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if let Some(remaining) = deadline.checked_duration_since(Instant::now()) {
                if tokio::time::timeout(remaining, notified).await.is_err() {
                    return self.try_pop();
                }
            } else {
                return self.try_pop();
            }
        }
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Handle returned from `subscribe`; dropping the receiver plus calling
/// `unsubscribe` detaches the client.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Event>,
}

#[derive(Default)]
pub struct EventBus {
    content_queues: Mutex<HashMap<String, Arc<ChatQueue>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    backlog: Mutex<VecDeque<Event>>,
    next_subscriber_id: Mutex<u64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a chat state change to the per-chat queue and the global
    /// subscriber set.
    pub fn publish_state(&self, chat_id: &str, state: ChatState) {
        let event = Event::state(chat_id, state);
        self.content_queue(chat_id).push(event.clone());
        self.broadcast(event);
    }

    /// Publish a content chunk to the chat's queue and broadcast it.
    pub fn publish_content(&self, chat_id: &str, event_type: &str, content: &str) {
        self.publish_event(Event::content(chat_id, event_type, content));
    }

    /// Publish a pre-built event (content + metadata) on both paths.
    pub fn publish_event(&self, event: Event) {
        if let Some(chat_id) = event.chat_id.clone() {
            self.content_queue(&chat_id).push(event.clone());
        }
        self.broadcast(event);
    }

    /// Broadcast-only: no per-chat queue involvement (file state changes,
    /// router decisions, ping frames).
    pub fn broadcast(&self, event: Event) {
        let snapshot: Vec<(u64, mpsc::Sender<Event>)> = {
            let subscribers = self.subscribers.lock();
            if subscribers.is_empty() {
                drop(subscribers);
                debug!(event_type = %event.event_type, "No subscribers, storing event in backlog");
                self.store_backlog(event);
                return;
            }
            subscribers.iter().map(|s| (s.id, s.tx.clone())).collect()
        };

        let mut delivered = false;
        let mut evicted = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered = true,
                Err(mpsc::error::TrySendError::Full(_)) => evicted.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(id),
            }
        }

        if !evicted.is_empty() {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|s| !evicted.contains(&s.id));
            warn!(count = evicted.len(), "Removed stale subscriber(s) with full queues");
        }

        if !delivered {
            warn!(event_type = %event.event_type, "No subscriber accepted event, storing in backlog");
            self.store_backlog(event);
        }
    }

    /// Register a subscriber queue. Any buffered backlog is drained into
    /// the new queue, in insertion order, ahead of live events.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

        let id = {
            let mut next = self.next_subscriber_id.lock();
            *next += 1;
            *next
        };

        let backlog = {
            let mut backlog = self.backlog.lock();
            backlog.drain(..).collect::<Vec<_>>()
        };
        if !backlog.is_empty() {
            debug!(count = backlog.len(), "Replaying backlog to new subscriber");
            for event in backlog {
                if tx.try_send(event).is_err() {
                    warn!("Subscriber queue full while replaying backlog; dropping remainder");
                    break;
                }
            }
        }

        self.subscribers.lock().push(Subscriber { id, tx });
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn content_queue(&self, chat_id: &str) -> Arc<ChatQueue> {
        let mut queues = self.content_queues.lock();
        queues
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(ChatQueue::default()))
            .clone()
    }

    /// Drop the chat's content queue, discarding anything still buffered.
    pub fn cleanup_queue(&self, chat_id: &str) {
        if let Some(queue) = self.content_queues.lock().remove(chat_id) {
            let drained = queue.len();
            if drained > 0 {
                debug!(chat_id = %chat_id, drained, "Cleaned up content queue");
            }
        }
    }

    /// Block until the chat's content queue has been empty continuously
    /// for `idle_grace`, or until `timeout`. Returns false on timeout.
    pub async fn wait_for_queue_drain(
        &self,
        chat_id: &str,
        timeout: Duration,
        idle_grace: Duration,
    ) -> bool {
        let queue = {
            let queues = self.content_queues.lock();
            match queues.get(chat_id) {
                Some(q) => q.clone(),
                None => return true,
            }
        };

        let start = Instant::now();
        let mut last_non_empty = start;
        loop {
            let now = Instant::now();
            if queue.is_empty() {
                if now.duration_since(last_non_empty) >= idle_grace {
                    return true;
                }
            } else {
                last_non_empty = now;
            }

            if now.duration_since(start) >= timeout {
                debug!(chat_id = %chat_id, "Queue drain timeout, pending items remain");
                return false;
            }
            tokio::time::sleep(QUEUE_DRAIN_POLL).await;
        }
    }

    fn store_backlog(&self, event: Event) {
        let mut backlog = self.backlog.lock();
        backlog.push_back(event);
        while backlog.len() > BACKLOG_EVENT_LIMIT {
            backlog.pop_front();
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_with_metadata() {
        let event = Event::content("c1", "model_retry", "")
            .with_meta("retry_data", serde_json::json!({"attempt": 2, "delay_seconds": 1.5}))
            .with_meta("task_id", serde_json::json!("t-9"));
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.chat_id.as_deref(), Some("c1"));
        assert_eq!(decoded.event_type, "model_retry");
        assert_eq!(decoded.metadata["retry_data"]["attempt"], 2);
        assert_eq!(decoded.metadata["task_id"], "t-9");
    }

    #[test]
    fn unknown_metadata_fields_pass_through() {
        let raw = r#"{"chat_id":"c2","type":"coder_file_revert","payload":{"file_path":"a.rs","undocumented":true}}"#;
        let decoded: Event = serde_json::from_str(raw).unwrap();
        assert_eq!(decoded.metadata["payload"]["undocumented"], true);
        let reencoded = serde_json::to_string(&decoded).unwrap();
        assert!(reencoded.contains("undocumented"));
    }

    #[tokio::test]
    async fn backlog_replays_in_insertion_order() {
        let bus = EventBus::new();
        bus.publish_content("c1", "answer_start", "");
        bus.publish_content("c1", "answer", "hello");
        bus.publish_content("c1", "complete", "");

        let mut sub = bus.subscribe();
        let mut types = Vec::new();
        while let Ok(event) = sub.rx.try_recv() {
            types.push(event.event_type);
        }
        assert_eq!(types, vec!["answer_start", "answer", "complete"]);
    }

    #[tokio::test]
    async fn backlog_is_ring_bounded() {
        let bus = EventBus::new();
        for i in 0..(BACKLOG_EVENT_LIMIT + 20) {
            bus.publish_content("c1", "answer", &format!("chunk {i}"));
        }
        assert_eq!(bus.backlog_len(), BACKLOG_EVENT_LIMIT);

        let mut sub = bus.subscribe();
        let first = sub.rx.try_recv().expect("backlog should replay");
        // Oldest 20 events were evicted
        assert_eq!(first.content.as_deref(), Some("chunk 20"));
    }

    #[tokio::test]
    async fn queue_drain_waits_for_consumer() {
        let bus = Arc::new(EventBus::new());
        bus.publish_content("c1", "answer", "pending");

        let drained = bus
            .wait_for_queue_drain("c1", Duration::from_millis(50), Duration::from_millis(10))
            .await;
        assert!(!drained, "queue with pending item must not report drained");

        bus.content_queue("c1").try_pop();
        let drained = bus
            .wait_for_queue_drain("c1", Duration::from_millis(200), Duration::from_millis(10))
            .await;
        assert!(drained);
    }

    #[tokio::test]
    async fn full_subscriber_is_evicted_not_blocked() {
        let bus = EventBus::new();
        let sub = bus.subscribe();
        for i in 0..(SUBSCRIBER_QUEUE_CAPACITY + 10) {
            bus.publish_content("c1", "answer", &format!("{i}"));
        }
        // The overflowing publishes evicted the stalled subscriber and the
        // overflow landed in the backlog for the next connection.
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.backlog_len() > 0);
        drop(sub);
    }
}
