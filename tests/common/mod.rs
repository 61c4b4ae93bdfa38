// tests/common/mod.rs
// Shared fixtures for engine-level integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use atlas_backend::config::AtlasConfig;
use atlas_backend::engine::{DomainExecutor, RetryConfig};
use atlas_backend::events::Event;
use atlas_backend::providers::{ChatProvider, ProviderMap};
use atlas_backend::state::{AppState, StateOverrides};
use atlas_backend::store::ChatStore;

pub const TEST_PROVIDER: &str = "scripted";
pub const TEST_MODEL: &str = "scripted-model";

pub fn test_config() -> AtlasConfig {
    let mut config = AtlasConfig::from_env();
    config.chat.default_provider = TEST_PROVIDER.to_string();
    config.chat.default_model = TEST_MODEL.to_string();
    config.chat.router_enabled = false;
    config.chat.execution_mode = "async".to_string();
    config
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        jitter: false,
    }
}

pub async fn state_with_provider(provider: Arc<dyn ChatProvider>) -> AppState {
    state_with(provider, None).await
}

pub async fn state_with(
    provider: Arc<dyn ChatProvider>,
    domains: Option<Arc<dyn DomainExecutor>>,
) -> AppState {
    let store = ChatStore::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory store");

    let mut providers = ProviderMap::default();
    providers.register(provider);

    AppState::from_store(
        test_config(),
        store,
        StateOverrides {
            providers: Some(providers),
            domains,
            retry: Some(fast_retry()),
            ..Default::default()
        },
    )
    .await
    .expect("Failed to build app state")
}

/// Wait until the dispatcher reports the chat idle, failing the test
/// after `timeout`.
pub async fn wait_until_idle(state: &AppState, chat_id: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while state.dispatcher.is_processing(chat_id) {
        if tokio::time::Instant::now() > deadline {
            panic!("chat {chat_id} did not finish within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Drain everything currently buffered on a subscription receiver.
pub async fn drain_events(rx: &mut tokio::sync::mpsc::Receiver<Event>) -> Vec<Event> {
    // A short grace period lets in-flight publishes land
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn event_types(events: &[Event]) -> Vec<String> {
    events.iter().map(|e| e.event_type.clone()).collect()
}

pub fn concat_answers(events: &[Event]) -> String {
    events
        .iter()
        .filter(|e| e.event_type == "answer")
        .filter_map(|e| e.content.clone())
        .collect()
}
