// tests/store_test.rs
// Chat store tests - positional ordering, state transitions, cascades

use atlas_backend::error::StoreError;
use atlas_backend::store::{ChatState, ChatStore, FileRecord, SaveMessage};

async fn setup_store() -> ChatStore {
    ChatStore::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory store")
}

#[tokio::test]
async fn test_history_orders_by_numeric_position() {
    println!("\n=== Testing Numeric Position Ordering ===\n");
    let store = setup_store().await;
    store.create_chat("chat-a", None).await.unwrap();

    // Fifteen messages: lexicographic id ordering would put chat-a_10
    // through chat-a_15 before chat-a_2
    for i in 1..=15 {
        store
            .save_message("chat-a", SaveMessage::user(format!("message {i}")))
            .await
            .expect("Failed to save message");
    }

    let history = store.get_chat_history("chat-a").await.unwrap();
    assert_eq!(history.len(), 15);
    for (index, message) in history.iter().enumerate() {
        assert_eq!(
            message.position(),
            Some(index as u32 + 1),
            "message {} out of order",
            message.id
        );
        assert_eq!(message.content, format!("message {}", index + 1));
    }
    println!("+ 15 messages returned in strict positional order");
}

#[tokio::test]
async fn test_save_message_round_trip() {
    let store = setup_store().await;
    store.create_chat("chat-rt", None).await.unwrap();

    store
        .save_file_record(&FileRecord {
            id: "file-1".to_string(),
            original_name: "notes.txt".to_string(),
            stored_filename: "abc123_notes.txt".to_string(),
            file_size: 42,
            api_state: "ready".to_string(),
            provider: Some("scripted".to_string()),
            api_file_name: Some("remote/notes".to_string()),
            created_at: 0,
        })
        .await
        .unwrap();

    let id = store
        .save_message(
            "chat-rt",
            SaveMessage {
                provider: Some("scripted".to_string()),
                model: Some("scripted-model".to_string()),
                attached_file_ids: vec!["file-1".to_string()],
                router_enabled: true,
                router_decision: Some("{\"route\":\"direct\"}".to_string()),
                ..SaveMessage::user("hello")
            },
        )
        .await
        .unwrap();
    assert_eq!(id, "chat-rt_1");

    let history = store.get_chat_history("chat-rt").await.unwrap();
    let message = &history[0];
    assert_eq!(message.role, "user");
    assert_eq!(message.content, "hello");
    assert_eq!(message.provider.as_deref(), Some("scripted"));
    assert_eq!(message.model.as_deref(), Some("scripted-model"));
    assert!(message.router_enabled);

    let files = store.get_message_files(&id).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].id, "file-1");
}

#[tokio::test]
async fn test_update_message_is_idempotent() {
    let store = setup_store().await;
    store.create_chat("chat-u", None).await.unwrap();
    let id = store
        .save_message("chat-u", SaveMessage::assistant(""))
        .await
        .unwrap();

    store
        .update_message(&id, "partial text", Some("thinking"), None)
        .await
        .unwrap();
    store
        .update_message(&id, "partial text", Some("thinking"), None)
        .await
        .unwrap();

    let message = store.get_message(&id).await.unwrap().unwrap();
    assert_eq!(message.content, "partial text");
    assert_eq!(message.thoughts.as_deref(), Some("thinking"));
}

#[tokio::test]
async fn test_cascade_delete_removes_later_messages() {
    let store = setup_store().await;
    store.create_chat("chat-c", None).await.unwrap();
    for i in 1..=5 {
        store
            .save_message("chat-c", SaveMessage::user(format!("m{i}")))
            .await
            .unwrap();
    }

    let removed = store
        .cascade_delete_message("chat-c_3", "chat-c")
        .await
        .unwrap();
    assert_eq!(removed, 3, "target and the two later messages");

    let history = store.get_chat_history("chat-c").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history.last().unwrap().id, "chat-c_2");
}

#[tokio::test]
async fn test_state_transitions_are_validated() {
    let store = setup_store().await;
    store.create_chat("chat-s", None).await.unwrap();

    store
        .update_chat_state("chat-s", ChatState::Thinking)
        .await
        .expect("static -> thinking is legal");
    store
        .update_chat_state("chat-s", ChatState::Responding)
        .await
        .expect("thinking -> responding is legal");

    // responding -> thinking is not part of the lifecycle
    let err = store
        .update_chat_state("chat-s", ChatState::Thinking)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IllegalTransition { .. }));

    store
        .update_chat_state("chat-s", ChatState::Static)
        .await
        .expect("any state -> static is legal");
    assert_eq!(
        store.get_chat_state("chat-s").await.unwrap(),
        ChatState::Static
    );
}

#[tokio::test]
async fn test_file_state_is_monotone_except_error() {
    let store = setup_store().await;
    let record = FileRecord {
        id: "f-mono".to_string(),
        original_name: "a.bin".to_string(),
        stored_filename: "s_a.bin".to_string(),
        file_size: 1,
        api_state: "local".to_string(),
        provider: None,
        api_file_name: None,
        created_at: 0,
    };
    store.save_file_record(&record).await.unwrap();

    store
        .update_file_api_info("f-mono", "uploading", Some("scripted"), None)
        .await
        .unwrap();
    store
        .update_file_api_info("f-mono", "ready", None, Some("remote/a"))
        .await
        .unwrap();

    // A regression is ignored, not applied
    store
        .update_file_api_info("f-mono", "uploading", None, None)
        .await
        .unwrap();
    let record = store.get_file_record("f-mono").await.unwrap().unwrap();
    assert_eq!(record.api_state, "ready");

    // error is reachable from anywhere
    store
        .update_file_api_info("f-mono", "error", None, None)
        .await
        .unwrap();
    let record = store.get_file_record("f-mono").await.unwrap().unwrap();
    assert_eq!(record.api_state, "error");
}

#[tokio::test]
async fn test_resolve_api_file_names_skips_unready_files() {
    let store = setup_store().await;
    for (id, state, provider) in [
        ("f-ready", "ready", Some("scripted")),
        ("f-pending", "processing", Some("scripted")),
        ("f-other", "ready", Some("other-provider")),
    ] {
        store
            .save_file_record(&FileRecord {
                id: id.to_string(),
                original_name: format!("{id}.txt"),
                stored_filename: format!("s_{id}.txt"),
                file_size: 1,
                api_state: state.to_string(),
                provider: provider.map(String::from),
                api_file_name: Some(format!("remote/{id}")),
                created_at: 0,
            })
            .await
            .unwrap();
    }

    let resolved = store
        .resolve_api_file_names(
            &[
                "f-ready".to_string(),
                "f-pending".to_string(),
                "f-other".to_string(),
                "f-missing".to_string(),
            ],
            "scripted",
            "scripted",
        )
        .await
        .unwrap();
    assert_eq!(resolved, vec!["remote/f-ready".to_string()]);
}

#[tokio::test]
async fn test_find_main_chat_walks_belongsto() {
    let store = setup_store().await;
    store.create_chat("root-chat", None).await.unwrap();
    store
        .create_chat_full("version_1_1", None, Some("edit_1"), true, Some("root-chat"))
        .await
        .unwrap();
    store
        .create_chat_full("version_1_2", None, Some("retry_1"), true, Some("version_1_1"))
        .await
        .unwrap();

    assert_eq!(
        store.find_main_chat("version_1_2").await.unwrap().as_deref(),
        Some("root-chat")
    );
    assert_eq!(
        store.find_main_chat("root-chat").await.unwrap().as_deref(),
        Some("root-chat")
    );
}

#[tokio::test]
async fn test_token_usage_rows() {
    let store = setup_store().await;
    store.create_chat("chat-t", None).await.unwrap();
    store
        .save_token_usage("chat-t", Some("chat-t_2"), "assistant", "scripted", "m", 120, 95)
        .await
        .unwrap();

    let rows = store.get_token_usage("chat-t").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].estimated_tokens, 120);
    assert_eq!(rows[0].actual_tokens, 95);
}
