use std::collections::BTreeMap;
use std::sync::Arc;

use async_openai::types::chat::{
    ChatCompletionMessageToolCalls, ChatCompletionRequestAssistantMessageArgs,
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImage,
    ChatCompletionRequestMessageContentPartText, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestToolMessage, ChatCompletionRequestToolMessageContent,
    ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContentPart,
    ChatCompletionStreamOptions, ChatCompletionTool, ChatCompletionTools,
    ChatCompletionToolChoiceOption, CreateChatCompletionRequest, FunctionObject, ImageUrl,
    ToolChoiceOptions,
};
use async_openai::Client;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use strand_types::{
    AgentError, ContentPart, Message, MessageContent, MessageType, ToolCall, ToolCallKind,
    UsageRecord, UsageRecorder,
};
use tokio::sync::mpsc;

use super::provider_config::{ProviderConfig, ProviderEndpoint, ANTHROPIC_FAMILY};
use super::resolve::ModelResolver;
use super::sanitize::sanitize_messages;
use super::{
    with_backoff, BillingContext, ChunkStream, FinishReason, LlmClient, LlmRequest, LlmResponse,
    StreamEvent, ToolChoice,
};
use crate::context::TokenEstimator;

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Chat client for OpenAI-compatible endpoints. The wire adapter below is
/// the single place where per-family quirks live.
pub struct OpenAiCompatLlm {
    config: ProviderConfig,
    resolver: ModelResolver,
    billing: Arc<dyn UsageRecorder>,
}

impl std::fmt::Debug for OpenAiCompatLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiCompatLlm")
            .field("default_model", &self.config.default_model)
            .finish()
    }
}

impl OpenAiCompatLlm {
    pub fn new(config: ProviderConfig, billing: Arc<dyn UsageRecorder>) -> Self {
        let resolver = ModelResolver::from_config(&config);
        Self {
            config,
            resolver,
            billing,
        }
    }

    pub fn resolver(&self) -> &ModelResolver {
        &self.resolver
    }

    fn endpoint(&self, family: &str) -> Result<ProviderEndpoint, AgentError> {
        self.config
            .endpoint_for(family)
            .cloned()
            .ok_or_else(|| {
                AgentError::InvalidConfiguration(format!(
                    "no endpoint configured for provider family {family}"
                ))
            })
    }

    fn build_request(
        &self,
        canonical: &str,
        family: &str,
        request: &LlmRequest,
    ) -> CreateChatCompletionRequest {
        let sanitized = sanitize_messages(&request.messages);
        let messages = map_messages(&sanitized);

        let tools: Vec<ChatCompletionTools> = request.tools.iter().map(map_tool).collect();
        let tool_choice = match request.tool_choice {
            ToolChoice::Auto => None,
            ToolChoice::None => Some(ChatCompletionToolChoiceOption::Mode(ToolChoiceOptions::None)),
            ToolChoice::Required => Some(ChatCompletionToolChoiceOption::Mode(
                ToolChoiceOptions::Required,
            )),
        };

        // Anthropic-compatible endpoints reject requests without an output
        // cap.
        let max_completion_tokens = match request.max_tokens {
            Some(max) => Some(max),
            None if family == ANTHROPIC_FAMILY => Some(4096),
            None => None,
        };

        tracing::info!(
            target: "llm.request",
            model = %canonical,
            family = %family,
            messages = messages.len(),
            tools = tools.len(),
            temperature = request.temperature,
            "LLM request"
        );

        CreateChatCompletionRequest {
            model: canonical.to_string(),
            messages,
            temperature: Some(request.temperature),
            max_completion_tokens,
            tools: (!tools.is_empty()).then_some(tools),
            tool_choice,
            ..Default::default()
        }
    }

    fn record_usage(
        &self,
        billing: &BillingContext,
        model: &str,
        started_at: chrono::DateTime<Utc>,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) {
        self.billing.record_usage(UsageRecord {
            user_id: billing.user_id,
            run_id: billing.run_id,
            started_at,
            ended_at: Utc::now(),
            model_name: model.to_string(),
            prompt_tokens: Some(prompt_tokens),
            completion_tokens: Some(completion_tokens),
        });
    }
}

#[async_trait::async_trait]
impl LlmClient for OpenAiCompatLlm {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, AgentError> {
        let canonical = self.resolver.resolve(&request.model);
        let family = self.config.family_of(&canonical).to_string();
        let endpoint = self.endpoint(&family)?;
        let wire_request = self.build_request(&canonical, &family, &request);
        let deadline = self.config.request_deadline;
        let started_at = Utc::now();

        let response = with_backoff("chat.create", || {
            let client = Client::with_config(endpoint.clone());
            let wire_request = wire_request.clone();
            async move {
                tokio::time::timeout(deadline, client.chat().create(wire_request))
                    .await
                    .map_err(|_| {
                        AgentError::Transient("LLM request deadline exceeded".to_string())
                    })?
                    .map_err(map_openai_error)
            }
        })
        .await?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| AgentError::LlmError("response contained no choices".to_string()))?;
        let content = choice.message.content.clone().unwrap_or_default();
        let tool_calls = choice
            .message
            .tool_calls
            .as_ref()
            .map(|calls| calls.iter().map(map_tool_call).collect::<Vec<_>>())
            .unwrap_or_default();

        let (prompt_tokens, completion_tokens) = match response.usage.as_ref() {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => estimate_usage(&request.messages, &content),
        };

        let finish_reason = match choice.finish_reason {
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            Some(reason) => map_finish_reason(reason),
            None => FinishReason::Stop,
        };

        self.record_usage(
            &request.billing,
            &canonical,
            started_at,
            prompt_tokens,
            completion_tokens,
        );

        Ok(LlmResponse {
            id: response.id.clone(),
            model: canonical,
            content,
            tool_calls,
            prompt_tokens,
            completion_tokens,
            finish_reason,
        })
    }

    async fn generate_stream(&self, request: LlmRequest) -> Result<ChunkStream, AgentError> {
        let canonical = self.resolver.resolve(&request.model);
        let family = self.config.family_of(&canonical).to_string();
        let endpoint = self.endpoint(&family)?;
        let mut wire_request = self.build_request(&canonical, &family, &request);
        wire_request.stream = Some(true);
        // Ask for usage on the final chunk; not every provider honors it.
        wire_request.stream_options = Some(ChatCompletionStreamOptions {
            include_usage: Some(true),
            include_obfuscation: None,
        });
        let deadline = self.config.request_deadline;
        let started_at = Utc::now();

        let stream = with_backoff("chat.create_stream", || {
            let client = Client::with_config(endpoint.clone());
            let wire_request = wire_request.clone();
            async move {
                tokio::time::timeout(deadline, client.chat().create_stream(wire_request))
                    .await
                    .map_err(|_| {
                        AgentError::Transient("LLM request deadline exceeded".to_string())
                    })?
                    .map_err(map_openai_error)
            }
        })
        .await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let billing = self.billing.clone();
        let billing_ctx = request.billing;
        let prompt_messages = request.messages;
        let model = canonical.clone();

        tokio::spawn(async move {
            #[derive(Default)]
            struct PartialToolCall {
                id: Option<String>,
                name: Option<String>,
                arguments: String,
            }

            let mut stream = stream;
            let mut content = String::new();
            let mut response_id = String::new();
            let mut partials: BTreeMap<u32, PartialToolCall> = BTreeMap::new();
            let mut usage: Option<(u32, u32)> = None;
            let mut finish_reason: Option<FinishReason> = None;
            let deadline_at = tokio::time::Instant::now() + deadline;

            loop {
                let next = match tokio::time::timeout_at(deadline_at, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        let _ = tx
                            .send(StreamEvent::Error(
                                "LLM stream deadline exceeded".to_string(),
                            ))
                            .await;
                        return;
                    }
                };
                let chunk = match next {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                    // End marker: the SSE stream is exhausted.
                    None => break,
                };

                if response_id.is_empty() {
                    response_id = chunk.id.clone();
                }
                if let Some(chunk_usage) = &chunk.usage {
                    usage = Some((chunk_usage.prompt_tokens, chunk_usage.completion_tokens));
                }
                let Some(choice) = chunk.choices.first() else {
                    continue;
                };
                if let Some(reason) = choice.finish_reason {
                    finish_reason = Some(map_finish_reason(reason));
                }
                if let Some(delta) = &choice.delta.content {
                    if !delta.is_empty() {
                        content.push_str(delta);
                        if tx.send(StreamEvent::Delta(delta.clone())).await.is_err() {
                            // Consumer went away; closing the stream cancels
                            // the HTTP request.
                            return;
                        }
                    }
                }
                if let Some(tool_deltas) = &choice.delta.tool_calls {
                    for tool_delta in tool_deltas {
                        let entry = partials.entry(tool_delta.index).or_default();
                        if let Some(id) = tool_delta.id.clone() {
                            entry.id = Some(id);
                        }
                        if let Some(function) = &tool_delta.function {
                            if let Some(name) = function.name.clone() {
                                if entry.name.is_none() {
                                    entry.name = Some(name);
                                }
                            }
                            if let Some(arguments) = function.arguments.clone() {
                                entry.arguments.push_str(&arguments);
                            }
                        }
                    }
                }
            }

            let mut tool_calls: Vec<ToolCall> = Vec::new();
            for partial in partials.values() {
                if partial.name.is_none() && partial.arguments.is_empty() {
                    continue;
                }
                let id = partial
                    .id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let name = partial.name.clone().unwrap_or_default();
                tool_calls.push(strand_parsers::from_provider(&id, &name, &partial.arguments));
            }

            let (prompt_tokens, completion_tokens) =
                usage.unwrap_or_else(|| estimate_usage(&prompt_messages, &content));
            let finish_reason = if !tool_calls.is_empty() {
                FinishReason::ToolCalls
            } else {
                finish_reason.unwrap_or(FinishReason::Stop)
            };

            billing.record_usage(UsageRecord {
                user_id: billing_ctx.user_id,
                run_id: billing_ctx.run_id,
                started_at,
                ended_at: Utc::now(),
                model_name: model.clone(),
                prompt_tokens: Some(prompt_tokens),
                completion_tokens: Some(completion_tokens),
            });

            let _ = tx
                .send(StreamEvent::Done(Box::new(LlmResponse {
                    id: response_id,
                    model,
                    content,
                    tool_calls,
                    prompt_tokens,
                    completion_tokens,
                    finish_reason,
                })))
                .await;
        });

        Ok(ChunkStream::new(rx))
    }
}

fn map_tool(schema: &strand_types::ToolSchema) -> ChatCompletionTools {
    ChatCompletionTools::Function(ChatCompletionTool {
        function: FunctionObject {
            name: schema.name.clone(),
            description: Some(schema.description.clone()),
            parameters: Some(schema.parameters.clone()),
            strict: None,
        },
    })
}

fn map_tool_call(tool_call: &ChatCompletionMessageToolCalls) -> ToolCall {
    match tool_call {
        ChatCompletionMessageToolCalls::Function(call) => {
            strand_parsers::from_provider(&call.id, &call.function.name, &call.function.arguments)
        }
        ChatCompletionMessageToolCalls::Custom(call) => {
            strand_parsers::from_provider(&call.id, &call.custom_tool.name, &call.custom_tool.input)
        }
    }
}

fn map_finish_reason(reason: async_openai::types::chat::FinishReason) -> FinishReason {
    use async_openai::types::chat::FinishReason as Wire;
    match reason {
        Wire::Stop => FinishReason::Stop,
        Wire::Length => FinishReason::Length,
        Wire::ToolCalls => FinishReason::ToolCalls,
        Wire::ContentFilter => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

/// Deterministic fallback when the provider omits usage numbers.
fn estimate_usage(prompt: &[Message], completion: &str) -> (u32, u32) {
    let prompt_tokens = TokenEstimator::estimate_thread_tokens(prompt) as u32;
    let completion_tokens = TokenEstimator::estimate_text_tokens(completion) as u32;
    (prompt_tokens, completion_tokens)
}

fn map_openai_error(err: async_openai::error::OpenAIError) -> AgentError {
    let text = err.to_string();
    let lower = text.to_ascii_lowercase();
    const TRANSIENT_MARKERS: &[&str] = &[
        "429",
        "408",
        "500",
        "502",
        "503",
        "504",
        "rate limit",
        "timeout",
        "timed out",
        "connection",
        "overloaded",
        "temporarily",
    ];
    if TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker)) {
        AgentError::Transient(text)
    } else {
        AgentError::LlmError(text)
    }
}

fn map_messages(messages: &[Message]) -> Vec<ChatCompletionRequestMessage> {
    messages.iter().flat_map(map_message).collect()
}

fn map_message(message: &Message) -> Vec<ChatCompletionRequestMessage> {
    match message.message_type {
        MessageType::System => {
            let mut msg = ChatCompletionRequestSystemMessageArgs::default();
            msg.content(message.as_text().unwrap_or_default());
            vec![ChatCompletionRequestMessage::System(msg.build().unwrap())]
        }
        MessageType::User => {
            let mut msg = ChatCompletionRequestUserMessageArgs::default();
            match &message.content {
                MessageContent::Text(text) => {
                    msg.content(text.clone());
                }
                MessageContent::Parts(parts) => {
                    let mapped: Vec<ChatCompletionRequestUserMessageContentPart> =
                        parts.iter().filter_map(map_user_part).collect();
                    msg.content(mapped);
                }
            }
            vec![ChatCompletionRequestMessage::User(msg.build().unwrap())]
        }
        // Summaries are LLM-authored and join the conversation as assistant
        // turns.
        MessageType::Assistant | MessageType::Summary => {
            let mut msg = ChatCompletionRequestAssistantMessageArgs::default();
            if let Some(text) = message.as_text() {
                msg.content(text);
            }
            let tool_calls = message.tool_calls();
            let native: Vec<&ToolCall> = tool_calls
                .iter()
                .filter(|c| c.kind == ToolCallKind::Native)
                .collect();
            if !native.is_empty() {
                let wire_calls: Vec<ChatCompletionMessageToolCalls> = native
                    .iter()
                    .map(|call| {
                        ChatCompletionMessageToolCalls::Function(
                            async_openai::types::chat::ChatCompletionMessageToolCall {
                                id: call.id.clone(),
                                function: async_openai::types::chat::FunctionCall {
                                    name: call.name.clone(),
                                    arguments: serde_json::to_string(&call.arguments)
                                        .unwrap_or_default(),
                                },
                            },
                        )
                    })
                    .collect();
                msg.tool_calls(wire_calls);
            }
            vec![ChatCompletionRequestMessage::Assistant(
                msg.build().unwrap(),
            )]
        }
        MessageType::Tool => {
            let results = message.tool_results();
            if results.is_empty() {
                // XML tool output travels back as a user turn.
                let mut msg = ChatCompletionRequestUserMessageArgs::default();
                msg.content(message.as_text().unwrap_or_default());
                return vec![ChatCompletionRequestMessage::User(msg.build().unwrap())];
            }
            results
                .into_iter()
                .map(|result| {
                    let text = match result.output {
                        Value::String(s) => s,
                        other => serde_json::to_string(&other).unwrap_or_default(),
                    };
                    ChatCompletionRequestMessage::Tool(ChatCompletionRequestToolMessage {
                        content: ChatCompletionRequestToolMessageContent::Text(text),
                        tool_call_id: result.tool_call_id,
                    })
                })
                .collect()
        }
        // Status frames never reach the provider.
        MessageType::Status => Vec::new(),
    }
}

fn map_user_part(part: &ContentPart) -> Option<ChatCompletionRequestUserMessageContentPart> {
    match part {
        ContentPart::Text(text) => Some(ChatCompletionRequestUserMessageContentPart::Text(
            ChatCompletionRequestMessageContentPartText { text: text.clone() },
        )),
        ContentPart::ImageUrl(url) => Some(ChatCompletionRequestUserMessageContentPart::ImageUrl(
            ChatCompletionRequestMessageContentPartImage {
                image_url: ImageUrl {
                    url: url.clone(),
                    detail: None,
                },
            },
        )),
        _ => None,
    }
}
