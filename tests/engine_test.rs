// tests/engine_test.rs
// Async engine tests - straight-line streaming, retry, stop/cancel

mod common;

use std::sync::Arc;
use std::time::Duration;

use atlas_backend::dispatch::{DispatchOutcome, StreamRequest};
use atlas_backend::providers::ScriptedProvider;
use common::*;

fn stream_request(message: &str) -> StreamRequest {
    StreamRequest {
        message: Some(message.to_string()),
        provider: Some(TEST_PROVIDER.to_string()),
        model: Some(TEST_MODEL.to_string()),
        include_reasoning: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_straight_line_stream() {
    println!("\n=== Testing Straight-Line Stream ===\n");
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "hello world", 21));
    let state = state_with_provider(provider).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-x")).await.unwrap();

    let outcome = state
        .dispatcher
        .start_turn(&chat_id, &stream_request("hi"))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Started));

    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;
    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    println!("[events] {types:?}");

    // chat_state(responding) ... message_ids ... answer_start ... answer+
    // ... usage ... chat_state(static) ... complete, in that order
    let index_of = |wanted: &str| {
        types
            .iter()
            .position(|t| t == wanted)
            .unwrap_or_else(|| panic!("missing event {wanted}"))
    };
    assert!(index_of("message_ids") < index_of("answer_start"));
    assert!(index_of("answer_start") < index_of("answer"));
    assert!(index_of("usage") > index_of("answer"));
    assert_eq!(types.last().map(String::as_str), Some("complete"));

    // complete arrives only after the state returned to static
    let static_index = types
        .iter()
        .enumerate()
        .filter(|(_, t)| *t == "chat_state")
        .filter(|(i, _)| {
            events[*i].metadata.get("state").and_then(|v| v.as_str()) == Some("static")
        })
        .map(|(i, _)| i)
        .next_back()
        .expect("missing static state event");
    assert!(static_index < index_of("complete"));

    assert_eq!(concat_answers(&events), "hello world");

    // Persisted transcript matches the streamed text
    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, "chat-x_1");
    assert_eq!(history[0].role, "user");
    assert_eq!(history[0].content, "hi");
    assert_eq!(history[1].id, "chat-x_2");
    assert_eq!(history[1].role, "assistant");
    assert_eq!(history[1].content, "hello world");

    // The turn produced a reconciled usage row
    let usage = state.store.get_token_usage(&chat_id).await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].actual_tokens, 21);
    println!("+ Straight-line stream verified");
}

#[tokio::test]
async fn test_retry_then_success() {
    println!("\n=== Testing Retry Then Success ===\n");
    let provider = Arc::new(ScriptedProvider::failing_then_answering(TEST_PROVIDER, 2, "ok"));
    let state = state_with_provider(provider.clone()).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-retry")).await.unwrap();

    let outcome = state
        .dispatcher
        .start_turn(&chat_id, &stream_request("please answer"))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Started));

    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;
    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);

    let retries: Vec<&atlas_backend::events::Event> = events
        .iter()
        .filter(|e| e.event_type == "model_retry")
        .collect();
    assert_eq!(retries.len(), 2, "two failures mean two retry events");
    for (i, retry) in retries.iter().enumerate() {
        let data = retry.metadata.get("retry_data").expect("retry_data payload");
        assert_eq!(data["attempt"].as_u64(), Some(i as u64 + 1));
        assert_eq!(data["max_attempts"].as_u64(), Some(5));
        assert_eq!(data["model"].as_str(), Some(TEST_MODEL));
        assert!(data["delay_seconds"].as_f64().unwrap_or(-1.0) >= 0.0);
    }

    // Both retries precede the (only) answer_start of the final attempt
    let first_answer_start = types.iter().position(|t| t == "answer_start").unwrap();
    let last_retry = types.iter().rposition(|t| t == "model_retry").unwrap();
    assert!(last_retry < first_answer_start);

    assert_eq!(concat_answers(&events), "ok");
    assert_eq!(provider.call_count(), 3);

    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    assert_eq!(history[1].content, "ok", "only the final attempt persists");
    println!("+ Retry flow verified");
}

#[tokio::test]
async fn test_retry_exhaustion_emits_error() {
    let provider = Arc::new(ScriptedProvider::new(
        TEST_PROVIDER,
        vec![vec![Err(
            atlas_backend::error::ProviderStreamError::Interrupted("boom".to_string()),
        )]],
    ));
    let state = state_with_provider(provider).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-exhaust")).await.unwrap();
    state
        .dispatcher
        .start_turn(&chat_id, &stream_request("doomed"))
        .await;

    wait_until_idle(&state, &chat_id, Duration::from_secs(10)).await;
    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);

    assert_eq!(
        types.iter().filter(|t| *t == "model_retry").count(),
        4,
        "five attempts mean four retries"
    );
    assert_eq!(types.last().map(String::as_str), Some("error"));
    assert!(!types.contains(&"complete".to_string()), "error is terminal");
}

#[tokio::test]
async fn test_stop_persists_partial_content() {
    println!("\n=== Testing Stop Mid-Stream ===\n");
    let provider = Arc::new(
        ScriptedProvider::answering(TEST_PROVIDER, "one two three four five six seven eight", 10)
            .with_chunk_delay(Duration::from_millis(40)),
    );
    let state = state_with_provider(provider).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-stop")).await.unwrap();
    state
        .dispatcher
        .start_turn(&chat_id, &stream_request("long answer"))
        .await;

    // Wait for the first streamed chunk, then stop
    let mut saw_answer = false;
    for _ in 0..100 {
        if let Ok(event) = subscription.rx.try_recv() {
            if event.event_type == "answer" {
                saw_answer = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saw_answer, "stream never produced an answer chunk");

    assert!(state.dispatcher.stop_chat(&chat_id));
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;

    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    assert_eq!(types.last().map(String::as_str), Some("complete"));

    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    let assistant = &history[1];
    assert!(
        !assistant.content.is_empty(),
        "stop must persist accumulated partial content"
    );
    assert!(
        "one two three four five six seven eight".starts_with(&assistant.content),
        "partial content must be a prefix of the full answer"
    );
    println!("+ Stop saved {} chars of partial content", assistant.content.len());
}

#[tokio::test]
async fn test_cancel_discards_partial_content() {
    println!("\n=== Testing Cancel Mid-Stream ===\n");
    let provider = Arc::new(
        ScriptedProvider::answering(TEST_PROVIDER, "alpha beta gamma delta epsilon zeta", 10)
            .with_chunk_delay(Duration::from_millis(40)),
    );
    let state = state_with_provider(provider).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-cancel")).await.unwrap();
    state
        .dispatcher
        .start_turn(&chat_id, &stream_request("long answer"))
        .await;

    for _ in 0..100 {
        if let Ok(event) = subscription.rx.try_recv() {
            if event.event_type == "answer" {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(state.dispatcher.cancel_chat(&chat_id).await);
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;

    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    assert_eq!(types.last().map(String::as_str), Some("complete"));

    // The placeholder stays empty: cancel discards, it does not save.
    // Throttled flushes may have written an early chunk, but the forced
    // save path must not have run
    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(
        state.store.get_chat_state(&chat_id).await.unwrap(),
        atlas_backend::store::ChatState::Static
    );
    println!("+ Cancel left chat static with terminal complete");
}

#[tokio::test]
async fn test_repeated_stop_after_completion_is_noop() {
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "done", 4));
    let state = state_with_provider(provider).await;

    let chat_id = state.dispatcher.ensure_chat(Some("chat-noop")).await.unwrap();
    state
        .dispatcher
        .start_turn(&chat_id, &stream_request("quick"))
        .await;
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;

    assert!(!state.dispatcher.stop_chat(&chat_id), "stop after completion is a no-op");
    assert!(!state.dispatcher.stop_chat(&chat_id), "and stays a no-op");

    // cleanup_chat is safe to repeat as well
    state.dispatcher.engine().cleanup_chat(&chat_id);
    state.dispatcher.engine().cleanup_chat(&chat_id);
}

#[tokio::test]
async fn test_duplicate_message_is_blocked_within_window() {
    let provider = Arc::new(
        ScriptedProvider::answering(TEST_PROVIDER, "slow reply", 5)
            .with_chunk_delay(Duration::from_millis(50)),
    );
    let state = state_with_provider(provider).await;
    let chat_id = state.dispatcher.ensure_chat(Some("chat-dup")).await.unwrap();

    let first = state
        .dispatcher
        .start_turn(&chat_id, &stream_request("same message"))
        .await;
    assert!(matches!(first, DispatchOutcome::Started));

    let second = state
        .dispatcher
        .start_turn(&chat_id, &stream_request("same message"))
        .await;
    assert!(
        matches!(second, DispatchOutcome::Duplicate),
        "identical message within the window must be blocked, got {second:?}"
    );

    // Only one user message was persisted
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;
    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    let user_count = history.iter().filter(|m| m.role == "user").count();
    assert_eq!(user_count, 1);
}

#[tokio::test]
async fn test_backlog_replay_for_late_subscriber() {
    println!("\n=== Testing Backlog Replay ===\n");
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "replayed text", 8));
    let state = state_with_provider(provider).await;

    // The whole turn runs with nobody listening
    let chat_id = state.dispatcher.ensure_chat(Some("chat-late")).await.unwrap();
    state
        .dispatcher
        .start_turn(&chat_id, &stream_request("hello"))
        .await;
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;
    assert!(state.bus.backlog_len() > 0, "events must buffer in the backlog");

    // A late subscriber drains the backlog in publish order
    let mut subscription = state.bus.subscribe();
    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);

    let index_of = |wanted: &str| types.iter().position(|t| t == wanted).unwrap();
    assert!(index_of("message_ids") < index_of("answer_start"));
    assert!(index_of("answer_start") < index_of("answer"));
    assert_eq!(types.last().map(String::as_str), Some("complete"));
    assert_eq!(concat_answers(&events), "replayed text");
    assert_eq!(state.bus.backlog_len(), 0, "backlog drains on replay");
    println!("+ Late subscriber saw the full ordered sequence");
}

#[tokio::test]
async fn test_rate_limit_denial_does_not_block_the_turn() {
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "still works", 5));
    let state = state_with_provider(provider).await;

    // Deny all tokens for this model; the reservation fails instantly
    // and the dispatcher logs-and-continues
    state
        .limiter
        .settings()
        .set_override(
            Some(TEST_PROVIDER),
            Some(TEST_MODEL),
            atlas_backend::config::RateLimitConfig {
                tokens_per_minute: Some(0),
                ..Default::default()
            },
            false,
        )
        .unwrap();

    let chat_id = state.dispatcher.ensure_chat(Some("chat-limited")).await.unwrap();
    let outcome = state
        .dispatcher
        .start_turn(&chat_id, &stream_request("are you there?"))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Started));

    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;
    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    assert_eq!(history[1].content, "still works");
}
