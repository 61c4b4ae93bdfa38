// tests/versioning_test.rs
// Versioning tests - branch copies, version records, lineage lookups

use atlas_backend::store::{ChatStore, SaveMessage};
use atlas_backend::versioning::{VersionOperationRequest, VersioningService};

async fn seeded_service() -> (VersioningService, ChatStore) {
    let store = ChatStore::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory store");
    store.create_chat("chat-x", Some("be helpful")).await.unwrap();

    // X_1 user, X_2 assistant, X_3 user, X_4 assistant, X_5 user
    for (role, content) in [
        ("user", "first question"),
        ("assistant", "first answer"),
        ("user", "second question"),
        ("assistant", "second answer"),
        ("user", "third question"),
    ] {
        store
            .save_message(
                "chat-x",
                SaveMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    (VersioningService::new(store.clone()), store)
}

fn request(op: &str, message_id: &str, new_content: Option<&str>) -> VersionOperationRequest {
    VersionOperationRequest {
        operation_type: op.to_string(),
        message_id: message_id.to_string(),
        chat_id: "chat-x".to_string(),
        new_content: new_content.map(String::from),
    }
}

#[tokio::test]
async fn test_edit_user_message_copies_prefix_and_streams() {
    println!("\n=== Testing Edit-Regenerate Versioning ===\n");
    let (service, store) = seeded_service().await;

    let result = service
        .apply_operation(&request("edit", "chat-x_3", Some("edited")))
        .await
        .expect("edit should succeed");

    assert!(result.needs_streaming);
    assert_eq!(result.stream_message.as_deref(), Some("edited"));
    assert_eq!(result.message_count, 3, "prefix plus the edited message");
    assert_eq!(result.belongsto, "chat-x");
    let version_chat_id = result.version_chat_id.clone();
    assert_eq!(
        result.target_message_id.as_deref(),
        Some(format!("{version_chat_id}_3").as_str())
    );

    let version_chat = store.get_chat(&version_chat_id).await.unwrap().unwrap();
    assert!(version_chat.isversion);
    assert_eq!(version_chat.belongsto.as_deref(), Some("chat-x"));
    assert_eq!(version_chat.name.as_deref(), Some("edit_1"));
    assert_eq!(version_chat.system_prompt.as_deref(), Some("be helpful"));

    let history = store.get_chat_history(&version_chat_id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].role, "user");
    assert_eq!(history[2].content, "edited");

    // Versions recorded for the slot: original first, edit second
    let versions = service
        .get_message_versions(&format!("{version_chat_id}_3"))
        .await
        .unwrap();
    assert_eq!(versions.versions.len(), 2);
    assert_eq!(versions.versions[0].operation, "original");
    assert_eq!(versions.versions[0].chat_version_id, "chat-x");
    assert_eq!(versions.versions[1].operation, "edit");
    assert_eq!(versions.versions[1].chat_version_id, version_chat_id);
    println!("+ Edit branch and version records verified");
}

#[tokio::test]
async fn test_edit_assistant_replaces_slot_without_streaming() {
    let (service, store) = seeded_service().await;

    let result = service
        .apply_operation(&request("edit", "chat-x_4", Some("rewritten answer")))
        .await
        .unwrap();

    assert!(!result.needs_streaming);
    assert_eq!(result.message_count, 5, "full transcript with slot replaced");

    let history = store.get_chat_history(&result.version_chat_id).await.unwrap();
    assert_eq!(history.len(), 5);
    assert_eq!(history[3].role, "assistant");
    assert_eq!(history[3].content, "rewritten answer");
    assert_eq!(history[4].content, "third question");
}

#[tokio::test]
async fn test_retry_on_assistant_targets_preceding_user() {
    let (service, store) = seeded_service().await;

    let result = service
        .apply_operation(&request("retry", "chat-x_4", None))
        .await
        .unwrap();

    assert!(result.needs_streaming);
    assert_eq!(
        result.stream_message.as_deref(),
        Some("second question"),
        "retry replays the user message that produced the answer"
    );
    assert_eq!(result.message_count, 3, "copy up to and including the user turn");

    let history = store.get_chat_history(&result.version_chat_id).await.unwrap();
    assert_eq!(history.last().unwrap().content, "second question");
}

#[tokio::test]
async fn test_delete_copies_strict_prefix() {
    let (service, store) = seeded_service().await;

    let result = service
        .apply_operation(&request("delete", "chat-x_3", None))
        .await
        .unwrap();

    assert!(!result.needs_streaming);
    assert_eq!(result.message_count, 2);
    assert!(result.target_message_id.is_none());

    let history = store.get_chat_history(&result.version_chat_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].content, "first answer");
}

#[tokio::test]
async fn test_version_numbers_are_dense_per_slot() {
    let (service, _store) = seeded_service().await;

    for content in ["edit one", "edit two", "edit three"] {
        service
            .apply_operation(&request("edit", "chat-x_3", Some(content)))
            .await
            .unwrap();
    }

    let versions = service.get_message_versions("chat-x_3").await.unwrap();
    let numbers: Vec<i64> = versions.versions.iter().map(|v| v.version_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4], "dense and increasing");
    assert_eq!(versions.versions[0].operation, "original");
    assert!(versions
        .versions
        .iter()
        .skip(1)
        .all(|v| v.operation == "edit"));
}

#[tokio::test]
async fn test_version_chat_names_count_per_operation() {
    let (service, store) = seeded_service().await;

    service
        .apply_operation(&request("edit", "chat-x_3", Some("a")))
        .await
        .unwrap();
    service
        .apply_operation(&request("retry", "chat-x_3", None))
        .await
        .unwrap();
    let second_edit = service
        .apply_operation(&request("edit", "chat-x_3", Some("b")))
        .await
        .unwrap();

    let chat = store
        .get_chat(&second_edit.version_chat_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        chat.name.as_deref(),
        Some("edit_2"),
        "edit counter is independent of retry branches"
    );
}

#[tokio::test]
async fn test_chat_version_tree_structure() {
    let (service, _store) = seeded_service().await;

    let edit = service
        .apply_operation(&request("edit", "chat-x_3", Some("branched")))
        .await
        .unwrap();

    // A second-level branch off the edit chat
    let nested = service
        .apply_operation(&VersionOperationRequest {
            operation_type: "retry".to_string(),
            message_id: format!("{}_3", edit.version_chat_id),
            chat_id: edit.version_chat_id.clone(),
            new_content: None,
        })
        .await
        .unwrap();

    let tree = service.get_chat_versions(&nested.version_chat_id).await.unwrap();
    assert_eq!(tree["main_chat_id"], serde_json::json!("chat-x"));
    assert_eq!(tree["version_tree"]["id"], serde_json::json!("chat-x"));

    let children = tree["version_tree"]["children"].as_array().unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0]["id"], serde_json::json!(edit.version_chat_id));
    let grandchildren = children[0]["children"].as_array().unwrap();
    assert_eq!(grandchildren.len(), 1);
    assert_eq!(
        grandchildren[0]["id"],
        serde_json::json!(nested.version_chat_id)
    );
    assert_eq!(grandchildren[0]["is_active"], serde_json::json!(true));
}
