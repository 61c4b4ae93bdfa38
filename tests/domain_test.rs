// tests/domain_test.rs
// Domain execution tests - tool approval round-trips, stale decisions,
// coder workspace parking and resume

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use atlas_backend::engine::{
    DomainEvent, DomainEventCallback, DomainExecutor, DomainTaskRequest, DomainTaskResult,
    StreamTurnParams, ToolDecisionRequest,
};
use atlas_backend::providers::ScriptedProvider;
use atlas_backend::router::RouterDecision;
use atlas_backend::store::SaveMessage;
use common::*;

/// Scripted domain executor: pops one result per call and mirrors a
/// `state` event through the callback before returning.
struct MockDomainExecutor {
    task_results: Mutex<VecDeque<DomainTaskResult>>,
    decision_results: Mutex<VecDeque<DomainTaskResult>>,
    decisions_seen: Mutex<Vec<ToolDecisionRequest>>,
}

impl MockDomainExecutor {
    fn new(task_results: Vec<DomainTaskResult>, decision_results: Vec<DomainTaskResult>) -> Self {
        Self {
            task_results: Mutex::new(task_results.into()),
            decision_results: Mutex::new(decision_results.into()),
            decisions_seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DomainExecutor for MockDomainExecutor {
    async fn execute_domain_task(
        &self,
        request: DomainTaskRequest,
        events: DomainEventCallback,
    ) -> anyhow::Result<DomainTaskResult> {
        events(DomainEvent {
            event: "state".to_string(),
            task_id: Some("task-1".to_string()),
            domain_id: Some(request.domain_id.clone()),
            payload: Some(serde_json::json!({"phase": "planning"})),
        });
        Ok(self
            .task_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| DomainTaskResult::completed("default output")))
    }

    async fn handle_tool_decision(
        &self,
        decision: ToolDecisionRequest,
        _events: DomainEventCallback,
    ) -> anyhow::Result<DomainTaskResult> {
        self.decisions_seen.lock().push(decision);
        Ok(self
            .decision_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| DomainTaskResult::completed("decision done")))
    }
}

fn domain_decision(route: &str, domain_id: &str) -> RouterDecision {
    RouterDecision {
        domain_id: Some(domain_id.to_string()),
        execution_type: Some("domain".to_string()),
        ..RouterDecision::direct(route)
    }
}

async fn start_domain_turn(
    state: &atlas_backend::state::AppState,
    chat_id: &str,
    message: &str,
    route: &str,
    domain_id: &str,
) {
    let user_message_id = state
        .store
        .save_message(chat_id, SaveMessage::user(message))
        .await
        .unwrap();
    let params = StreamTurnParams {
        chat_id: chat_id.to_string(),
        message: message.to_string(),
        provider: TEST_PROVIDER.to_string(),
        model: TEST_MODEL.to_string(),
        include_reasoning: false,
        attached_file_ids: vec![],
        user_message_id,
        is_retry: false,
        router_decision: Some(domain_decision(route, domain_id)),
        estimated_tokens: 0,
    };
    assert!(matches!(
        state.dispatcher.engine().start_streaming_turn(params),
        atlas_backend::engine::StartOutcome::Started
    ));
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_tool_approval_round_trip_and_stale_duplicate() {
    println!("\n=== Testing Domain Tool Approval Round-Trip ===\n");
    let executor = Arc::new(MockDomainExecutor::new(
        vec![DomainTaskResult::waiting_user("May I run this tool?", "task-1")],
        vec![DomainTaskResult::completed("tool executed, task finished")],
    ));
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "-", 1));
    let state = state_with(provider, Some(executor.clone())).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-domain")).await.unwrap();
    start_domain_turn(&state, &chat_id, "research this", "web_researcher", "web").await;
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;

    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    println!("[events] {types:?}");

    // The web domain prompts the frontend to open its window, the
    // planner streams a state update, and the task parks waiting
    assert!(types.contains(&"web_window_prompt".to_string()));
    assert!(types.contains(&"domain_execution_update".to_string()));
    assert!(types.contains(&"domain_execution".to_string()));
    assert!(
        !types.contains(&"complete".to_string()),
        "waiting_user keeps the turn open"
    );
    assert!(state.dispatcher.engine().has_domain_session(&chat_id));

    // [1] the user approves the tool
    let decision = ToolDecisionRequest {
        chat_id: chat_id.clone(),
        task_id: "task-1".to_string(),
        call_id: "call-1".to_string(),
        decision: "accept".to_string(),
        batch_mode: true,
        ..Default::default()
    };
    let response = state
        .dispatcher
        .send_domain_tool_decision(decision.clone())
        .await;
    assert_eq!(response["success"], serde_json::json!(true));
    assert_eq!(response["status"], serde_json::json!("completed"));
    assert_eq!(executor.decisions_seen.lock().len(), 1);

    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    assert!(types.contains(&"complete".to_string()));
    assert!(!state.dispatcher.engine().has_domain_session(&chat_id));

    // [2] a duplicate approval inside the grace window is absorbed
    let stale = state.dispatcher.send_domain_tool_decision(decision).await;
    assert_eq!(stale["success"], serde_json::json!(true));
    assert_eq!(stale["stale_request"], serde_json::json!(true));
    assert_eq!(
        executor.decisions_seen.lock().len(),
        1,
        "stale approval must not re-execute"
    );
    println!("+ Approval round-trip and stale duplicate verified");
}

#[tokio::test]
async fn test_completed_domain_turn_persists_output() {
    let executor = Arc::new(MockDomainExecutor::new(
        vec![DomainTaskResult::completed("summarized findings")],
        vec![],
    ));
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "-", 1));
    let state = state_with(provider, Some(executor)).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-dcomp")).await.unwrap();
    start_domain_turn(&state, &chat_id, "do research", "web_researcher", "web").await;
    wait_until_idle(&state, &chat_id, Duration::from_secs(5)).await;

    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    assert_eq!(types.last().map(String::as_str), Some("complete"));

    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    let assistant = history.last().unwrap();
    assert_eq!(assistant.role, "assistant");
    assert_eq!(assistant.content, "summarized findings");
    assert!(assistant.domain_execution.is_some());
}

#[tokio::test]
async fn test_coder_turn_parks_until_workspace_selected() {
    println!("\n=== Testing Coder Workspace Parking ===\n");
    let executor = Arc::new(MockDomainExecutor::new(
        vec![DomainTaskResult::completed("implemented the change")],
        vec![],
    ));
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "-", 1));
    let state = state_with(provider, Some(executor)).await;

    let mut subscription = state.bus.subscribe();
    let chat_id = state.dispatcher.ensure_chat(Some("chat-coder")).await.unwrap();
    start_domain_turn(&state, &chat_id, "refactor the parser", "coder", "coder").await;
    {
        let engine = state.dispatcher.engine().clone();
        let chat = chat_id.clone();
        wait_for(
            move || engine.is_waiting_for_workspace(&chat),
            Duration::from_secs(5),
            "workspace prompt",
        )
        .await;
    }

    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    assert!(
        types.contains(&"coder_workspace_prompt".to_string()),
        "missing workspace prompt in {types:?}"
    );

    // The user picks a workspace and resumes
    let workspace = tempfile::tempdir().expect("tempdir");
    state
        .store
        .set_coder_workspace(&chat_id, workspace.path().to_str().unwrap())
        .await
        .unwrap();
    let response = state.dispatcher.workspace_selected(&chat_id).await;
    assert_eq!(response["success"], serde_json::json!(true));

    {
        let engine = state.dispatcher.engine().clone();
        let chat = chat_id.clone();
        wait_for(
            move || !engine.is_processing(&chat),
            Duration::from_secs(5),
            "resumed turn to finish",
        )
        .await;
    }
    let events = drain_events(&mut subscription.rx).await;
    let types = event_types(&events);
    assert!(types.contains(&"complete".to_string()));

    let history = state.store.get_chat_history(&chat_id).await.unwrap();
    let assistant = history
        .iter()
        .rev()
        .find(|m| m.role == "assistant")
        .expect("assistant message");
    assert_eq!(assistant.content, "implemented the change");
    println!("+ Workspace parking and resume verified");
}

#[tokio::test]
async fn test_cancel_clears_workspace_pending() {
    let executor = Arc::new(MockDomainExecutor::new(vec![], vec![]));
    let provider = Arc::new(ScriptedProvider::answering(TEST_PROVIDER, "-", 1));
    let state = state_with(provider, Some(executor)).await;

    let chat_id = state.dispatcher.ensure_chat(Some("chat-coder-cancel")).await.unwrap();
    start_domain_turn(&state, &chat_id, "edit the file please", "coder", "coder").await;
    {
        let engine = state.dispatcher.engine().clone();
        let chat = chat_id.clone();
        wait_for(
            move || engine.is_waiting_for_workspace(&chat),
            Duration::from_secs(5),
            "workspace prompt",
        )
        .await;
    }

    assert!(state.dispatcher.cancel_chat(&chat_id).await);
    assert!(!state.dispatcher.engine().is_waiting_for_workspace(&chat_id));

    // Nothing resumes once cancelled
    let response = state.dispatcher.workspace_selected(&chat_id).await;
    assert_eq!(response["success"], serde_json::json!(false));
}
