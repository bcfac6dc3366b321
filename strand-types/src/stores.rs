use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::{Message, MessageType, NewMessage, Thread};
use crate::errors::AgentError;
use crate::events::ControlSignal;
use crate::runs::{AgentRun, NewAgentRun, RunStatus, RunSubmission};

/// Sentinel account id that bypasses the referential check on thread
/// creation.
pub const DEMO_ACCOUNT_ID: &str = "demo";

/// Durable append-only log of messages per thread, plus thread and agent-run
/// metadata. Every write is durable before return; readers see their own
/// writes. Concurrent appends to the same thread are serialized by the store.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_thread(
        &self,
        project_id: Option<Uuid>,
        account_id: &str,
    ) -> Result<Thread, AgentError>;

    async fn get_thread(&self, thread_id: Uuid) -> Result<Thread, AgentError>;

    /// Deletes the thread and cascades to its messages.
    async fn delete_thread(&self, thread_id: Uuid) -> Result<(), AgentError>;

    async fn append_message(
        &self,
        thread_id: Uuid,
        message: NewMessage,
    ) -> Result<Message, AgentError>;

    /// All messages, ordered by creation timestamp then insertion order.
    async fn list_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, AgentError>;

    /// LLM-visible messages; when a summary exists, the latest summary
    /// followed only by messages created strictly after it.
    async fn list_llm_messages(&self, thread_id: Uuid) -> Result<Vec<Message>, AgentError>;

    async fn delete_messages_by_type(
        &self,
        thread_id: Uuid,
        message_type: MessageType,
    ) -> Result<usize, AgentError>;

    async fn create_run(&self, run: NewAgentRun) -> Result<AgentRun, AgentError>;

    async fn get_run(&self, run_id: Uuid) -> Result<AgentRun, AgentError>;

    /// Atomic, monotonic status update; `Conflict` on a non-monotonic change.
    async fn set_run_status(
        &self,
        run_id: Uuid,
        status: RunStatus,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<(), AgentError>;
}

/// A cold, pull-based stream of published payloads. Dropping the subscription
/// cancels delivery.
pub struct Subscription {
    rx: mpsc::Receiver<Value>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Value>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

/// Streaming of per-run events to any number of subscribers, control-signal
/// delivery, a bounded replay list per run, and TTL leases. Publication is
/// at-least-once to live subscribers; no exactly-once claim is made.
#[async_trait::async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), AgentError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, AgentError>;

    /// Appends to the bounded per-run replay list (TTL-bounded).
    async fn push_response(&self, run_id: Uuid, payload: Value) -> Result<(), AgentError>;

    /// Replays the persisted list from the given offset, preserving order.
    async fn replay(&self, run_id: Uuid, from_offset: usize) -> Result<Vec<Value>, AgentError>;

    async fn send_control(
        &self,
        run_id: Uuid,
        signal: ControlSignal,
        instance_id: Option<&str>,
    ) -> Result<(), AgentError>;

    /// Returns false when another instance already holds the lease.
    async fn acquire_lease(
        &self,
        run_id: Uuid,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, AgentError>;

    /// Returns false when the lease expired or was taken over.
    async fn refresh_lease(
        &self,
        run_id: Uuid,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<bool, AgentError>;

    async fn release_lease(&self, run_id: Uuid, instance_id: &str) -> Result<(), AgentError>;
}

/// At-least-once delivery of run submissions.
#[async_trait::async_trait]
pub trait WorkQueue: Send + Sync {
    async fn push(&self, submission: RunSubmission) -> Result<(), AgentError>;

    /// Waits for the next submission; `None` once the queue is closed.
    async fn pop(&self) -> Result<Option<RunSubmission>, AgentError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Sandbox execution service: file access by path and command execution,
/// scoped to a per-project sandbox.
#[async_trait::async_trait]
pub trait SandboxFs: Send + Sync {
    /// `Ok(None)` when the file does not exist.
    async fn read_file(&self, path: &str) -> Result<Option<String>, AgentError>;

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), AgentError>;

    async fn run_command(&self, command: &str) -> Result<CommandOutput, AgentError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub user_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub model_name: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
}

/// Billing collaborator; fire-and-forget from the core's perspective.
pub trait UsageRecorder: Send + Sync {
    fn record_usage(&self, record: UsageRecord);
}

/// Answers account/project existence for thread creation.
#[async_trait::async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account_exists(&self, account_id: &str) -> Result<bool, AgentError>;

    async fn project_exists(&self, project_id: Uuid) -> Result<bool, AgentError>;
}
