use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use strand_parsers::{parse_response, XmlToolParser};
use strand_types::{
    events::events_channel, status_types, AgentError, ContentPart, EventFrame, Message,
    MessageContent, MessageStore, MessageType, NewMessage, PubSub, SandboxFs, ToolCall,
    ToolCallKind, ToolContext, ToolExecutionStrategy, ToolOutcome,
};
use uuid::Uuid;

use crate::context::manager::synthetic_message;
use crate::context::ContextManager;
use crate::llm::{BillingContext, ChunkStream, FinishReason, LlmClient, LlmRequest, StreamEvent};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone)]
pub struct ThreadRunnerConfig {
    pub system_prompt: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub native_tool_calling: bool,
    pub xml_tool_calling: bool,
    pub stream: bool,
    pub enable_context_manager: bool,
    pub tool_strategy: ToolExecutionStrategy,
    pub max_xml_tool_calls: usize,
    pub native_max_auto_continues: u32,
}

impl Default for ThreadRunnerConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful AI assistant.".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.0,
            max_tokens: None,
            native_tool_calling: true,
            xml_tool_calling: true,
            stream: false,
            enable_context_manager: false,
            tool_strategy: ToolExecutionStrategy::Sequential,
            max_xml_tool_calls: 25,
            native_max_auto_continues: 3,
        }
    }
}

/// What one ThreadRunner invocation tells the orchestrator.
#[derive(Debug, Clone)]
pub struct IterationOutcome {
    /// The model asked for more tool work than the inner auto-continue
    /// budget allowed; the orchestrator should call again.
    pub should_continue: bool,
    pub terminating_tool: Option<String>,
    pub finish_reason: Option<FinishReason>,
    /// The cooperative stop flag was observed during this invocation.
    pub stopped: bool,
    /// Concatenated assistant text across inner passes.
    pub assistant_content: String,
}

/// Persists a status event and mirrors it onto the run's event channel and
/// replay list. Everything a subscriber sees goes through here.
pub(crate) struct RunEmitter {
    store: Arc<dyn MessageStore>,
    pubsub: Arc<dyn PubSub>,
    thread_id: Uuid,
    run_id: Uuid,
}

impl RunEmitter {
    pub(crate) fn new(
        store: Arc<dyn MessageStore>,
        pubsub: Arc<dyn PubSub>,
        thread_id: Uuid,
        run_id: Uuid,
    ) -> Self {
        Self {
            store,
            pubsub,
            thread_id,
            run_id,
        }
    }

    /// Persisted + published status event.
    pub(crate) async fn status(
        &self,
        status_type: &str,
        content: Value,
    ) -> Result<EventFrame, AgentError> {
        self.status_with_metadata(status_type, content, &[]).await
    }

    pub(crate) async fn status_with_metadata(
        &self,
        status_type: &str,
        content: Value,
        metadata: &[(&str, Value)],
    ) -> Result<EventFrame, AgentError> {
        let mut frame =
            EventFrame::status(status_type, content).with_thread_run_id(self.run_id);
        for (key, value) in metadata {
            frame = frame.with_metadata(key, value.clone());
        }

        let mut persisted = json!({ "status_type": status_type });
        if let (Value::Object(target), Value::Object(source)) = (&mut persisted, &frame.content) {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }
        let mut record = NewMessage::status(MessageContent::Text(persisted.to_string()))
            .with_metadata("thread_run_id", json!(self.run_id.to_string()));
        for (key, value) in metadata {
            record = record.with_metadata(key, value.clone());
        }
        self.store.append_message(self.thread_id, record).await?;

        self.publish_frame(frame.clone()).await?;
        Ok(frame)
    }

    /// Published (and replayable) but not persisted; used for assistant
    /// payloads and streaming deltas.
    pub(crate) async fn publish_frame(&self, frame: EventFrame) -> Result<(), AgentError> {
        let value = frame.to_value();
        self.pubsub
            .publish(&events_channel(self.run_id), value.clone())
            .await?;
        self.pubsub.push_response(self.run_id, value).await?;
        Ok(())
    }
}

struct ToolPassResult {
    terminating_tool: Option<String>,
    stopped: bool,
}

/// One turn of the agent loop: compose prompt, call the LLM, parse and run
/// tool calls, persist every artifact, and stream status events.
pub struct ThreadRunner {
    store: Arc<dyn MessageStore>,
    pubsub: Arc<dyn PubSub>,
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    context_manager: Option<Arc<ContextManager>>,
    sandbox: Option<Arc<dyn SandboxFs>>,
}

impl ThreadRunner {
    pub fn new(
        store: Arc<dyn MessageStore>,
        pubsub: Arc<dyn PubSub>,
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            pubsub,
            registry,
            llm,
            context_manager: None,
            sandbox: None,
        }
    }

    pub fn with_context_manager(mut self, context_manager: Arc<ContextManager>) -> Self {
        self.context_manager = Some(context_manager);
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxFs>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Runs one orchestrator iteration, including the inner auto-continue
    /// loop. On error, an error status frame is persisted and published
    /// before the error is returned.
    pub async fn run(
        &self,
        thread_id: Uuid,
        run_id: Uuid,
        config: &ThreadRunnerConfig,
        temporary_message: Option<String>,
        billing: BillingContext,
        stop: Arc<AtomicBool>,
    ) -> Result<IterationOutcome, AgentError> {
        let emitter = RunEmitter::new(
            self.store.clone(),
            self.pubsub.clone(),
            thread_id,
            run_id,
        );
        match self
            .run_inner(thread_id, run_id, config, temporary_message, billing, stop, &emitter)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let _ = emitter
                    .status(status_types::ERROR, json!({ "message": e.to_string() }))
                    .await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_inner(
        &self,
        thread_id: Uuid,
        run_id: Uuid,
        config: &ThreadRunnerConfig,
        temporary_message: Option<String>,
        billing: BillingContext,
        stop: Arc<AtomicBool>,
        emitter: &RunEmitter,
    ) -> Result<IterationOutcome, AgentError> {
        emitter
            .status(
                status_types::THREAD_RUN_START,
                json!({ "thread_id": thread_id.to_string(), "model": config.model }),
            )
            .await?;

        let mut assistant_content = String::new();
        let mut finish_reason: Option<FinishReason> = None;
        let mut terminating_tool: Option<String> = None;
        let mut stopped = false;
        let mut wants_more = false;
        let mut pass: u32 = 0;

        loop {
            if config.enable_context_manager {
                if let Some(context_manager) = &self.context_manager {
                    context_manager
                        .check_and_summarize_if_needed(thread_id, &config.model, false)
                        .await?;
                }
            }

            // History is re-read every pass so a fresh summary takes effect
            // immediately.
            let history = self.store.list_llm_messages(thread_id).await?;
            let prompt = self.compose_prompt(
                thread_id,
                config,
                history,
                if pass == 0 {
                    temporary_message.as_deref()
                } else {
                    None
                },
            );

            let tools = if config.native_tool_calling {
                self.registry.openai_schemas()
            } else {
                Vec::new()
            };

            emitter
                .status(status_types::ASSISTANT_RESPONSE_START, json!({}))
                .await?;

            let request = LlmRequest {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
                tools,
                billing,
                ..LlmRequest::new(prompt, &config.model)
            };
            let response = if config.stream {
                let stream = self.llm.generate_stream(request).await?;
                self.drain_stream(stream, emitter).await?
            } else {
                self.llm.generate(request).await?
            };

            let bindings = if config.xml_tool_calling {
                self.registry.xml_bindings()
            } else {
                Default::default()
            };
            let xml_parser = XmlToolParser::new(bindings, config.max_xml_tool_calls);
            let native_calls = if config.native_tool_calling {
                response.tool_calls.clone()
            } else {
                Vec::new()
            };
            let parsed = parse_response(&response.content, native_calls, &xml_parser);

            let pass_finish = if parsed.xml_limit_reached {
                FinishReason::XmlToolLimitReached
            } else if !parsed.tool_calls.is_empty() {
                FinishReason::ToolCalls
            } else {
                response.finish_reason.clone()
            };

            let assistant_message = self
                .persist_assistant_message(thread_id, &response.content, &parsed.tool_calls)
                .await?;
            emitter
                .publish_frame(
                    EventFrame::assistant(json!({
                        "role": "assistant",
                        "content": response.content,
                        "tool_calls": parsed.tool_calls,
                    }))
                    .with_thread_run_id(run_id),
                )
                .await?;
            assistant_content.push_str(&response.content);

            let tool_pass = self
                .execute_tools(
                    &parsed.tool_calls,
                    assistant_message.message_id,
                    thread_id,
                    run_id,
                    config,
                    emitter,
                    &stop,
                )
                .await?;
            if tool_pass.stopped {
                stopped = true;
            }
            if tool_pass.terminating_tool.is_some() {
                terminating_tool = tool_pass.terminating_tool;
            }
            finish_reason = Some(pass_finish.clone());

            let auto_continue = pass_finish == FinishReason::ToolCalls
                && terminating_tool.is_none()
                && !stopped
                && !stop.load(Ordering::Relaxed);
            pass += 1;

            if !auto_continue {
                wants_more = false;
                break;
            }
            if pass > config.native_max_auto_continues {
                // Budget exhausted; hand control back to the orchestrator.
                wants_more = true;
                break;
            }
        }

        if stop.load(Ordering::Relaxed) {
            stopped = true;
        }

        Ok(IterationOutcome {
            should_continue: wants_more && !stopped && terminating_tool.is_none(),
            terminating_tool,
            finish_reason,
            stopped,
            assistant_content,
        })
    }

    fn compose_prompt(
        &self,
        thread_id: Uuid,
        config: &ThreadRunnerConfig,
        history: Vec<Message>,
        temporary_message: Option<&str>,
    ) -> Vec<Message> {
        let mut system_prompt = config.system_prompt.clone();
        if config.xml_tool_calling {
            let examples = self.registry.xml_examples();
            if !examples.is_empty() {
                system_prompt.push_str(
                    "\n\nYou can invoke tools by emitting their XML tags in your response:\n",
                );
                for (tag, example) in examples {
                    system_prompt.push_str(&format!("\n<!-- {tag} -->\n{example}\n"));
                }
            }
        }

        let mut prompt = Vec::with_capacity(history.len() + 2);
        prompt.push(synthetic_message(
            thread_id,
            MessageType::System,
            system_prompt,
        ));

        match temporary_message {
            Some(text) => {
                let temporary =
                    synthetic_message(thread_id, MessageType::User, text.to_string());
                let last_user = history
                    .iter()
                    .rposition(|m| m.message_type == MessageType::User);
                match last_user {
                    Some(index) => {
                        prompt.extend(history[..index].iter().cloned());
                        prompt.push(temporary);
                        prompt.extend(history[index..].iter().cloned());
                    }
                    None => {
                        prompt.extend(history);
                        prompt.push(temporary);
                    }
                }
            }
            None => prompt.extend(history),
        }
        prompt
    }

    async fn drain_stream(
        &self,
        mut stream: ChunkStream,
        emitter: &RunEmitter,
    ) -> Result<crate::llm::LlmResponse, AgentError> {
        while let Some(event) = stream.recv().await {
            match event {
                StreamEvent::Delta(delta) => {
                    emitter
                        .publish_frame(
                            EventFrame::assistant(json!({ "delta": delta }))
                                .with_metadata("streaming", json!(true))
                                .with_thread_run_id(emitter.run_id),
                        )
                        .await?;
                }
                StreamEvent::Done(response) => return Ok(*response),
                StreamEvent::Error(message) => return Err(AgentError::LlmError(message)),
            }
        }
        Err(AgentError::LlmError(
            "stream ended without a final response".to_string(),
        ))
    }

    async fn persist_assistant_message(
        &self,
        thread_id: Uuid,
        content: &str,
        tool_calls: &[ToolCall],
    ) -> Result<Message, AgentError> {
        let mut parts = Vec::new();
        if !content.is_empty() {
            parts.push(ContentPart::Text(content.to_string()));
        }
        for call in tool_calls.iter().filter(|c| c.kind == ToolCallKind::Native) {
            parts.push(ContentPart::ToolCall(call.clone()));
        }
        let message = if parts.len() == 1 && tool_calls.is_empty() {
            NewMessage::assistant(content)
        } else {
            NewMessage::assistant(MessageContent::Parts(parts))
        };
        self.store.append_message(thread_id, message).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_tools(
        &self,
        calls: &[ToolCall],
        assistant_message_id: Uuid,
        thread_id: Uuid,
        run_id: Uuid,
        config: &ThreadRunnerConfig,
        emitter: &RunEmitter,
        stop: &AtomicBool,
    ) -> Result<ToolPassResult, AgentError> {
        let mut result = ToolPassResult {
            terminating_tool: None,
            stopped: false,
        };
        if calls.is_empty() {
            return Ok(result);
        }

        let mut context = ToolContext::new(thread_id, run_id);
        if let Some(sandbox) = &self.sandbox {
            context = context.with_sandbox(sandbox.clone());
        }
        let context = Arc::new(context);

        match config.tool_strategy {
            ToolExecutionStrategy::Sequential => {
                for call in calls {
                    // The stop flag is honored between tool invocations;
                    // in-flight tools always run to completion.
                    if stop.load(Ordering::Relaxed) {
                        result.stopped = true;
                        break;
                    }
                    emitter
                        .status(status_types::TOOL_STARTED, tool_event_content(call, None))
                        .await?;
                    let outcome = self.registry.invoke(call, context.clone()).await;
                    let terminated = self
                        .record_tool_result(call, &outcome, assistant_message_id, thread_id, emitter)
                        .await?;
                    if terminated {
                        result.terminating_tool = Some(call.name.clone());
                        break;
                    }
                }
            }
            ToolExecutionStrategy::Parallel => {
                for call in calls {
                    emitter
                        .status(status_types::TOOL_STARTED, tool_event_content(call, None))
                        .await?;
                }
                let outcomes = futures::future::join_all(
                    calls.iter().map(|call| self.registry.invoke(call, context.clone())),
                )
                .await;
                // Completions joined above; results are recorded in
                // tool-call index order.
                for (call, outcome) in calls.iter().zip(outcomes) {
                    let terminated = self
                        .record_tool_result(call, &outcome, assistant_message_id, thread_id, emitter)
                        .await?;
                    if terminated && result.terminating_tool.is_none() {
                        result.terminating_tool = Some(call.name.clone());
                    }
                }
            }
        }
        Ok(result)
    }

    /// Persists the tool message and emits the completion event. Returns
    /// true when a terminating tool ran successfully.
    async fn record_tool_result(
        &self,
        call: &ToolCall,
        outcome: &ToolOutcome,
        assistant_message_id: Uuid,
        thread_id: Uuid,
        emitter: &RunEmitter,
    ) -> Result<bool, AgentError> {
        let terminating = self.registry.is_terminating(&call.name) && outcome.success;

        let content = match call.kind {
            ToolCallKind::Native => {
                MessageContent::Parts(vec![ContentPart::ToolResult(strand_types::ToolResult {
                    tool_call_id: call.id.clone(),
                    assistant_message_id: Some(assistant_message_id.to_string()),
                    success: outcome.success,
                    output: outcome.output.clone(),
                })])
            }
            ToolCallKind::Xml => MessageContent::Text(wrap_xml_result(call, outcome)),
        };

        let mut message = NewMessage::new(MessageType::Tool, content)
            .with_metadata("tool_call_id", json!(call.id))
            .with_metadata("tool_name", json!(call.name))
            .with_metadata(
                "assistant_message_id",
                json!(assistant_message_id.to_string()),
            );
        if terminating {
            message = message.with_metadata("agent_should_terminate", json!(true));
        }
        let persisted = self.store.append_message(thread_id, message).await?;
        emitter
            .publish_frame(
                EventFrame::tool(serde_json::to_value(&persisted.content)?)
                    .with_metadata("tool_call_id", json!(call.id))
                    .with_metadata("tool_name", json!(call.name))
                    .with_thread_run_id(emitter.run_id),
            )
            .await?;

        let status_type = if outcome.success {
            status_types::TOOL_COMPLETED
        } else {
            status_types::TOOL_FAILED
        };
        let mut metadata: Vec<(&str, Value)> = Vec::new();
        if terminating {
            metadata.push(("agent_should_terminate", json!(true)));
        }
        emitter
            .status_with_metadata(
                status_type,
                tool_event_content(call, Some(outcome)),
                &metadata,
            )
            .await?;
        Ok(terminating)
    }
}

fn tool_event_content(call: &ToolCall, outcome: Option<&ToolOutcome>) -> Value {
    let mut content = json!({
        "tool_call_id": call.id,
        "tool_name": call.name,
    });
    if let (Value::Object(map), Some(outcome)) = (&mut content, outcome) {
        map.insert("success".to_string(), json!(outcome.success));
        map.insert("output".to_string(), outcome.output.clone());
    }
    content
}

/// XML tool output travels back to the model wrapped in its originating tag.
fn wrap_xml_result(call: &ToolCall, outcome: &ToolOutcome) -> String {
    let text = outcome.output_text();
    let escaped = quick_xml::escape::escape(text.as_str());
    format!(
        "<tool_result><{tag}>{escaped}</{tag}></tool_result>",
        tag = call.name
    )
}
