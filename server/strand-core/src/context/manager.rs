use std::sync::Arc;

use serde_json::json;
use strand_types::{AgentError, Message, MessageStore, MessageType, NewMessage};
use uuid::Uuid;

use super::estimator::TokenEstimator;
use crate::llm::{LlmClient, LlmRequest};

/// Minimum number of messages worth compressing; below this a summary would
/// cost more than it saves.
const MIN_MESSAGES_TO_SUMMARIZE: usize = 3;

#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Estimated-token threshold that triggers summarization.
    pub token_threshold: usize,
    /// Target size of the generated summary.
    pub summary_target_tokens: usize,
    /// Headroom reserved for the next turn.
    pub reserve_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_threshold: 120_000,
            summary_target_tokens: 10_000,
            reserve_tokens: 5_000,
        }
    }
}

/// Keeps a thread's token footprint below the threshold by replacing older
/// messages with a single LLM-generated summary message.
pub struct ContextManager {
    store: Arc<dyn MessageStore>,
    llm: Arc<dyn LlmClient>,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(
        store: Arc<dyn MessageStore>,
        llm: Arc<dyn LlmClient>,
        config: ContextConfig,
    ) -> Self {
        Self { store, llm, config }
    }

    /// Returns true when a summary message was appended. Idempotent while
    /// the estimated token count stays strictly below the threshold.
    pub async fn check_and_summarize_if_needed(
        &self,
        thread_id: Uuid,
        model: &str,
        force: bool,
    ) -> Result<bool, AgentError> {
        // Everything after the most recent prior summary.
        let window = self.store.list_llm_messages(thread_id).await?;
        let window: Vec<Message> = window
            .into_iter()
            .filter(|m| m.message_type != MessageType::Summary)
            .collect();

        let estimated_tokens = TokenEstimator::estimate_thread_tokens(&window);
        if estimated_tokens < self.config.token_threshold && !force {
            return Ok(false);
        }
        if window.len() < MIN_MESSAGES_TO_SUMMARIZE {
            tracing::debug!(
                thread_id = %thread_id,
                messages = window.len(),
                "not enough messages to summarize"
            );
            return Ok(false);
        }

        tracing::info!(
            thread_id = %thread_id,
            estimated_tokens,
            threshold = self.config.token_threshold,
            "summarizing conversation history"
        );

        let prompt = self.build_summary_prompt(&window, thread_id);
        let request = LlmRequest {
            temperature: 0.0,
            max_tokens: Some(self.config.summary_target_tokens as u32),
            ..LlmRequest::new(prompt, model)
        };
        let response = self.llm.generate(request).await?;
        if response.content.trim().is_empty() {
            return Err(AgentError::LlmError(
                "summarization returned empty content".to_string(),
            ));
        }

        let summary = NewMessage::new(MessageType::Summary, response.content)
            .with_metadata("token_count", json!(estimated_tokens));
        self.store.append_message(thread_id, summary).await?;
        Ok(true)
    }

    fn build_summary_prompt(&self, window: &[Message], thread_id: Uuid) -> Vec<Message> {
        let system = format!(
            "You are summarizing an agent conversation so it can continue in a \
             smaller context window.\n\
             Produce a factual, chronological summary of the conversation below.\n\
             - Preserve user intent, decisions made, and constraints discovered.\n\
             - Preserve tool invocations and their results; quote important tool \
               output rather than paraphrasing it.\n\
             - Do not invent content or editorialize.\n\
             Target length: at most {} tokens.",
            self.config.summary_target_tokens
        );

        let mut transcript = String::new();
        for message in window {
            let role = message.message_type.as_str();
            let text = message.as_text().unwrap_or_else(|| {
                serde_json::to_string(&message.content).unwrap_or_default()
            });
            transcript.push_str(&format!("[{role}] {text}\n"));
            for call in message.tool_calls() {
                transcript.push_str(&format!(
                    "[tool_call] {}({})\n",
                    call.name,
                    serde_json::to_string(&call.arguments).unwrap_or_default()
                ));
            }
            for result in message.tool_results() {
                transcript.push_str(&format!(
                    "[tool_result {}] {}\n",
                    if result.success { "ok" } else { "failed" },
                    serde_json::to_string(&result.output).unwrap_or_default()
                ));
            }
        }

        vec![
            synthetic_message(thread_id, MessageType::System, system),
            synthetic_message(
                thread_id,
                MessageType::User,
                format!("Summarize this conversation:\n\n{transcript}"),
            ),
        ]
    }
}

/// Prompt-only message; never persisted.
pub(crate) fn synthetic_message(
    thread_id: Uuid,
    message_type: MessageType,
    text: String,
) -> Message {
    Message {
        message_id: Uuid::new_v4(),
        thread_id,
        message_type,
        content: text.into(),
        is_llm_message: true,
        metadata: Default::default(),
        created_at: chrono::Utc::now(),
    }
}
