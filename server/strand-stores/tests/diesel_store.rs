#![cfg(feature = "sqlite")]

use std::sync::Arc;

use chrono::Utc;
use strand_stores::{DieselMessageStore, InMemoryAccountDirectory};
use strand_types::{
    AgentError, MessageStore, MessageType, NewAgentRun, NewMessage, RunStatus, DEMO_ACCOUNT_ID,
};
use uuid::Uuid;

async fn store() -> (tempfile::TempDir, DieselMessageStore) {
    let dir = tempfile::tempdir().unwrap();
    let database = dir.path().join("strand.db");
    let store = DieselMessageStore::connect(
        database.to_str().unwrap(),
        4,
        Arc::new(InMemoryAccountDirectory::new()),
    )
    .await
    .unwrap();
    (dir, store)
}

#[tokio::test]
async fn thread_and_message_round_trip() {
    let (_dir, store) = store().await;
    let thread = store.create_thread(None, DEMO_ACCOUNT_ID).await.unwrap();

    store
        .append_message(thread.thread_id, NewMessage::user("hello"))
        .await
        .unwrap();
    store
        .append_message(
            thread.thread_id,
            NewMessage::new(MessageType::Summary, "the story so far"),
        )
        .await
        .unwrap();
    store
        .append_message(thread.thread_id, NewMessage::user("and then"))
        .await
        .unwrap();

    let all = store.list_messages(thread.thread_id).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].as_text().unwrap(), "hello");

    let llm = store.list_llm_messages(thread.thread_id).await.unwrap();
    assert_eq!(llm.len(), 2);
    assert_eq!(llm[0].message_type, MessageType::Summary);
    assert_eq!(llm[1].as_text().unwrap(), "and then");
}

#[tokio::test]
async fn missing_thread_is_not_found() {
    let (_dir, store) = store().await;
    let missing = store
        .append_message(Uuid::new_v4(), NewMessage::user("lost"))
        .await;
    assert!(matches!(missing, Err(AgentError::NotFound(_))));
    assert!(matches!(
        store.create_thread(None, "nobody").await,
        Err(AgentError::NotFound(_))
    ));
}

#[tokio::test]
async fn run_status_transitions_are_enforced() {
    let (_dir, store) = store().await;
    let thread = store.create_thread(None, DEMO_ACCOUNT_ID).await.unwrap();
    let run_id = Uuid::new_v4();
    store
        .create_run(NewAgentRun {
            id: run_id,
            thread_id: thread.thread_id,
            model_name: "gpt-4o".to_string(),
            user_id: None,
        })
        .await
        .unwrap();

    store
        .set_run_status(run_id, RunStatus::Running, None, None)
        .await
        .unwrap();
    store
        .set_run_status(
            run_id,
            RunStatus::Failed,
            Some("boom".to_string()),
            Some(Utc::now()),
        )
        .await
        .unwrap();

    let run = store.get_run(run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("boom"));
    assert!(run.started_at.is_some());
    assert!(run.completed_at.is_some());

    let conflict = store
        .set_run_status(run_id, RunStatus::Completed, None, None)
        .await;
    assert!(matches!(conflict, Err(AgentError::Conflict(_))));
}

#[tokio::test]
async fn delete_thread_cascades_to_messages() {
    let (_dir, store) = store().await;
    let thread = store.create_thread(None, DEMO_ACCOUNT_ID).await.unwrap();
    store
        .append_message(thread.thread_id, NewMessage::user("gone soon"))
        .await
        .unwrap();
    store.delete_thread(thread.thread_id).await.unwrap();
    assert!(matches!(
        store.list_messages(thread.thread_id).await,
        Err(AgentError::NotFound(_))
    ));
}
