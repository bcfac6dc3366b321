use std::sync::Mutex;

use strand_types::{AgentError, RunSubmission, WorkQueue};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Process-local work queue for embedding and tests. Cross-process
/// deployments put a durable queue behind the same trait.
pub struct InMemoryWorkQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<RunSubmission>>>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<RunSubmission>>,
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: AsyncMutex::new(rx),
        }
    }

    /// Stops accepting submissions; `pop` drains what is queued and then
    /// returns `None`.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

#[async_trait::async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn push(&self, submission: RunSubmission) -> Result<(), AgentError> {
        let guard = self.tx.lock().unwrap();
        let tx = guard
            .as_ref()
            .ok_or_else(|| AgentError::Storage("work queue closed".to_string()))?;
        tx.send(submission)
            .map_err(|_| AgentError::Storage("work queue closed".to_string()))
    }

    async fn pop(&self) -> Result<Option<RunSubmission>, AgentError> {
        Ok(self.rx.lock().await.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn submission() -> RunSubmission {
        RunSubmission {
            agent_run_id: Uuid::new_v4(),
            thread_id: Uuid::new_v4(),
            project_id: None,
            model_name: "gpt-4o".to_string(),
            enable_thinking: false,
            reasoning_effort: Default::default(),
            stream: false,
            enable_context_manager: false,
            user_id: None,
        }
    }

    #[tokio::test]
    async fn drains_in_order_then_ends_on_close() {
        let queue = InMemoryWorkQueue::new();
        let first = submission();
        let second = submission();
        queue.push(first.clone()).await.unwrap();
        queue.push(second.clone()).await.unwrap();
        queue.close();
        assert!(queue.push(submission()).await.is_err());

        assert_eq!(
            queue.pop().await.unwrap().unwrap().agent_run_id,
            first.agent_run_id
        );
        assert_eq!(
            queue.pop().await.unwrap().unwrap().agent_run_id,
            second.agent_run_id
        );
        assert!(queue.pop().await.unwrap().is_none());
    }
}
