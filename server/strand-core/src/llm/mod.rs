pub mod openai;
pub mod provider_config;
pub mod resolve;
pub mod sanitize;

pub use openai::OpenAiCompatLlm;
pub use provider_config::{ProviderConfig, ProviderEndpoint};
pub use resolve::ModelResolver;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strand_types::{AgentError, Message, ToolCall, ToolSchema};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const MAX_RETRIES: u32 = 3;
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    XmlToolLimitReached,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::XmlToolLimitReached => "xml_tool_limit_reached",
            FinishReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    #[default]
    Auto,
    None,
    Required,
}

/// Who pays for a call; forwarded to the billing collaborator on success.
#[derive(Debug, Clone, Copy, Default)]
pub struct BillingContext {
    pub user_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
}

/// A prepared completion request: conversation messages plus tool schemas.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub tools: Vec<ToolSchema>,
    pub tool_choice: ToolChoice,
    pub billing: BillingContext,
}

impl LlmRequest {
    pub fn new(messages: Vec<Message>, model: impl Into<String>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: 0.0,
            max_tokens: None,
            tools: Vec::new(),
            tool_choice: ToolChoice::Auto,
            billing: BillingContext::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub finish_reason: FinishReason,
}

/// Streamed completion events. `Done` is the sentinel end value and is
/// always the last event on a healthy stream.
#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Done(Box<LlmResponse>),
    Error(String),
}

/// Pull-based chunk stream; dropping it closes the underlying connection.
pub struct ChunkStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl ChunkStream {
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drains the stream, discarding deltas, and returns the final response.
    pub async fn collect(mut self) -> Result<LlmResponse, AgentError> {
        while let Some(event) = self.recv().await {
            match event {
                StreamEvent::Delta(_) => {}
                StreamEvent::Done(response) => return Ok(*response),
                StreamEvent::Error(message) => return Err(AgentError::LlmError(message)),
            }
        }
        Err(AgentError::LlmError(
            "stream ended without a final response".to_string(),
        ))
    }
}

/// Provider abstraction: request assembly, response parsing, and streaming
/// delta reconstruction, pluggable by model family.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync + std::fmt::Debug {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, AgentError>;

    async fn generate_stream(&self, request: LlmRequest) -> Result<ChunkStream, AgentError>;
}

/// Retries transient failures with exponential backoff; everything else
/// surfaces immediately.
pub(crate) async fn with_backoff<T, F, Fut>(label: &str, mut op: F) -> Result<T, AgentError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, AgentError>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                attempt += 1;
                tracing::warn!(
                    target: "llm.retry",
                    "{label}: transient error, retrying (attempt {attempt}/{MAX_RETRIES}): {e}"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}
