use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use strand_types::{
    AccountDirectory, AgentError, AgentRun, Message, MessageStore, MessageType, NewAgentRun,
    NewMessage, RunStatus, Thread,
};
use uuid::Uuid;

/// Account/project directory backed by plain maps; the demo sentinel is
/// handled by the store, not here.
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: DashMap<String, ()>,
    projects: DashMap<Uuid, ()>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account_id: &str) {
        self.accounts.insert(account_id.to_string(), ());
    }

    pub fn add_project(&self, project_id: Uuid) {
        self.projects.insert(project_id, ());
    }
}

#[async_trait::async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn account_exists(&self, account_id: &str) -> Result<bool, AgentError> {
        Ok(self.accounts.contains_key(account_id))
    }

    async fn project_exists(&self, project_id: Uuid) -> Result<bool, AgentError> {
        Ok(self.projects.contains_key(&project_id))
    }
}

struct StoredMessage {
    message: Message,
    seq: u64,
}

/// Message store for tests and single-process deployments. Appends to one
/// thread are serialized by the per-entry lock; ordering is commit order.
pub struct InMemoryMessageStore {
    directory: Arc<dyn AccountDirectory>,
    threads: DashMap<Uuid, Thread>,
    messages: DashMap<Uuid, Vec<StoredMessage>>,
    runs: DashMap<Uuid, AgentRun>,
    seq: AtomicU64,
}

impl InMemoryMessageStore {
    pub fn new(directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            directory,
            threads: DashMap::new(),
            messages: DashMap::new(),
            runs: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Store with an empty directory; threads belong to the demo account.
    pub fn for_demo() -> Self {
        Self::new(Arc::new(InMemoryAccountDirectory::new()))
    }

    fn ordered_messages(&self, thread_id: Uuid) -> Vec<Message> {
        let mut entries: Vec<(DateTime<Utc>, u64, Message)> = self
            .messages
            .get(&thread_id)
            .map(|stored| {
                stored
                    .iter()
                    .map(|s| (s.message.created_at, s.seq, s.message.clone()))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, _, m)| m).collect()
    }
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_thread(
        &self,
        project_id: Option<Uuid>,
        account_id: &str,
    ) -> Result<Thread, AgentError> {
        crate::ensure_owner_exists(self.directory.as_ref(), account_id, project_id).await?;

        let now = Utc::now();
        let thread = Thread {
            thread_id: Uuid::new_v4(),
            project_id,
            account_id: account_id.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.threads.insert(thread.thread_id, thread.clone());
        self.messages.insert(thread.thread_id, Vec::new());
        Ok(thread)
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Thread, AgentError> {
        self.threads
            .get(&thread_id)
            .map(|t| t.clone())
            .ok_or_else(|| AgentError::NotFound(format!("thread {thread_id} does not exist")))
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<(), AgentError> {
        self.threads
            .remove(&thread_id)
            .ok_or_else(|| AgentError::NotFound(format!("thread {thread_id} does not exist")))?;
        self.messages.remove(&thread_id);
        Ok(())
    }

    async fn append_message(
        &self,
        thread_id: Uuid,
        message: NewMessage,
    ) -> Result<Message, AgentError> {
        if !self.threads.contains_key(&thread_id) {
            return Err(AgentError::NotFound(format!(
                "thread {thread_id} does not exist"
            )));
        }

        let persisted = Message {
            message_id: Uuid::new_v4(),
            thread_id,
            message_type: message.message_type,
            content: message.content,
            is_llm_message: message.is_llm_message,
            metadata: message.metadata,
            created_at: Utc::now(),
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.messages.entry(thread_id).or_default().push(StoredMessage {
            message: persisted.clone(),
            seq,
        });
        if let Some(mut thread) = self.threads.get_mut(&thread_id) {
            thread.updated_at = persisted.created_at;
        }
        Ok(persisted)
    }

    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, AgentError> {
        if !self.threads.contains_key(&thread_id) {
            return Err(AgentError::NotFound(format!(
                "thread {thread_id} does not exist"
            )));
        }
        Ok(self.ordered_messages(thread_id))
    }

    async fn list_llm_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, AgentError> {
        let messages = self
            .list_messages(thread_id)
            .await?
            .into_iter()
            .filter(|m| m.is_llm_message)
            .collect();
        Ok(crate::trim_to_latest_summary(messages))
    }

    async fn delete_messages_by_type(
        &self,
        thread_id: Uuid,
        message_type: MessageType,
    ) -> Result<usize, AgentError> {
        let mut stored = self.messages.get_mut(&thread_id).ok_or_else(|| {
            AgentError::NotFound(format!("thread {thread_id} does not exist"))
        })?;
        let before = stored.len();
        stored.retain(|s| s.message.message_type != message_type);
        Ok(before - stored.len())
    }

    async fn create_run(&self, run: NewAgentRun) -> Result<AgentRun, AgentError> {
        if !self.threads.contains_key(&run.thread_id) {
            return Err(AgentError::NotFound(format!(
                "thread {} does not exist",
                run.thread_id
            )));
        }
        let now = Utc::now();
        let agent_run = AgentRun {
            id: run.id,
            thread_id: run.thread_id,
            status: RunStatus::Pending,
            error: None,
            started_at: None,
            completed_at: None,
            model_name: run.model_name,
            user_id: run.user_id,
            created_at: now,
            updated_at: now,
        };
        self.runs.insert(agent_run.id, agent_run.clone());
        Ok(agent_run)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<AgentRun, AgentError> {
        self.runs
            .get(&run_id)
            .map(|r| r.clone())
            .ok_or_else(|| AgentError::NotFound(format!("run {run_id} does not exist")))
    }

    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), AgentError> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| AgentError::NotFound(format!("run {run_id} does not exist")))?;
        if !run.status.can_transition_to(status) {
            return Err(AgentError::Conflict(format!(
                "run {run_id} cannot move from {} to {status}",
                run.status
            )));
        }
        run.status = status;
        run.error = error;
        run.updated_at = Utc::now();
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(run.updated_at);
        }
        if let Some(completed_at) = completed_at {
            run.completed_at = Some(completed_at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strand_types::{ContentPart, MessageContent, DEMO_ACCOUNT_ID};

    fn store_with_account() -> InMemoryMessageStore {
        let directory = Arc::new(InMemoryAccountDirectory::new());
        directory.add_account("acct-1");
        InMemoryMessageStore::new(directory)
    }

    #[tokio::test]
    async fn create_thread_validates_account() {
        let store = store_with_account();
        assert!(store.create_thread(None, "acct-1").await.is_ok());
        assert!(matches!(
            store.create_thread(None, "missing").await,
            Err(AgentError::NotFound(_))
        ));
        // The demo sentinel bypasses the check.
        assert!(store.create_thread(None, DEMO_ACCOUNT_ID).await.is_ok());
    }

    #[tokio::test]
    async fn append_requires_existing_thread() {
        let store = store_with_account();
        let result = store
            .append_message(Uuid::new_v4(), NewMessage::user("hi"))
            .await;
        assert!(matches!(result, Err(AgentError::NotFound(_))));
    }

    #[tokio::test]
    async fn messages_keep_insertion_order() {
        let store = store_with_account();
        let thread = store.create_thread(None, "acct-1").await.unwrap();
        for i in 0..5 {
            store
                .append_message(thread.thread_id, NewMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let listed = store.list_messages(thread.thread_id).await.unwrap();
        let texts: Vec<String> = listed.iter().filter_map(|m| m.as_text()).collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn llm_view_trims_to_latest_summary() {
        let store = store_with_account();
        let thread = store.create_thread(None, "acct-1").await.unwrap();
        store
            .append_message(thread.thread_id, NewMessage::user("old"))
            .await
            .unwrap();
        store
            .append_message(
                thread.thread_id,
                NewMessage::new(MessageType::Summary, "summary one"),
            )
            .await
            .unwrap();
        store
            .append_message(thread.thread_id, NewMessage::user("mid"))
            .await
            .unwrap();
        store
            .append_message(
                thread.thread_id,
                NewMessage::new(MessageType::Summary, "summary two"),
            )
            .await
            .unwrap();
        store
            .append_message(thread.thread_id, NewMessage::user("new"))
            .await
            .unwrap();
        // Status messages never reach the LLM view.
        store
            .append_message(
                thread.thread_id,
                NewMessage::status("noise").with_is_llm_message(false),
            )
            .await
            .unwrap();

        let llm = store.list_llm_messages(thread.thread_id).await.unwrap();
        assert_eq!(llm.len(), 2);
        assert_eq!(llm[0].message_type, MessageType::Summary);
        assert_eq!(llm[0].as_text().unwrap(), "summary two");
        assert_eq!(llm[1].as_text().unwrap(), "new");
    }

    #[tokio::test]
    async fn llm_view_of_empty_thread_is_empty() {
        let store = store_with_account();
        let thread = store.create_thread(None, "acct-1").await.unwrap();
        assert!(store
            .list_llm_messages(thread.thread_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn run_status_is_monotonic() {
        let store = store_with_account();
        let thread = store.create_thread(None, "acct-1").await.unwrap();
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
            .set_run_status(run_id, RunStatus::Completed, None, Some(Utc::now()))
            .await
            .unwrap();

        let conflict = store
            .set_run_status(run_id, RunStatus::Failed, Some("late".into()), None)
            .await;
        assert!(matches!(conflict, Err(AgentError::Conflict(_))));

        let run = store.get_run(run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn structured_content_survives_persistence() {
        let store = store_with_account();
        let thread = store.create_thread(None, "acct-1").await.unwrap();
        let content = MessageContent::Parts(vec![
            ContentPart::Text("see image".to_string()),
            ContentPart::ImageUrl("https://example.com/a.png".to_string()),
        ]);
        store
            .append_message(
                thread.thread_id,
                NewMessage::user(content.clone()).with_metadata("source", json!("test")),
            )
            .await
            .unwrap();
        let listed = store.list_messages(thread.thread_id).await.unwrap();
        assert_eq!(listed[0].content, content);
        assert_eq!(listed[0].metadata["source"], json!("test"));
    }

    #[tokio::test]
    async fn delete_messages_by_type_counts() {
        let store = store_with_account();
        let thread = store.create_thread(None, "acct-1").await.unwrap();
        store
            .append_message(thread.thread_id, NewMessage::user("keep"))
            .await
            .unwrap();
        store
            .append_message(thread.thread_id, NewMessage::status("drop"))
            .await
            .unwrap();
        store
            .append_message(thread.thread_id, NewMessage::status("drop too"))
            .await
            .unwrap();
        let removed = store
            .delete_messages_by_type(thread.thread_id, MessageType::Status)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list_messages(thread.thread_id).await.unwrap().len(), 1);
    }
}
