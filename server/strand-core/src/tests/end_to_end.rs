use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use strand_stores::{InMemoryMessageStore, InMemoryPubSub};
use strand_types::{
    AgentError, ControlSignal, MessageStore, MessageType, NewAgentRun, NewMessage, PubSub,
    RunStatus, RunSubmission, RuntimeConfig, Tool, ToolCall, ToolContext, ToolExecutionStrategy,
    XmlBinding, DEMO_ACCOUNT_ID,
};
use uuid::Uuid;

use super::mock_llm::MockLlm;
use crate::orchestrator::RunOrchestrator;
use crate::tools::{builtin::get_builtin_tools, ToolRegistry};

/// Counting test tool, optionally failing, optionally XML-callable.
#[derive(Debug)]
struct TestTool {
    name: String,
    calls: Arc<AtomicUsize>,
    fail: bool,
    xml: bool,
}

impl TestTool {
    fn search(calls: Arc<AtomicUsize>) -> Arc<dyn Tool> {
        Arc::new(Self {
            name: "search".to_string(),
            calls,
            fail: false,
            xml: true,
        })
    }

    fn failing(calls: Arc<AtomicUsize>) -> Arc<dyn Tool> {
        Arc::new(Self {
            name: "flaky".to_string(),
            calls,
            fail: true,
            xml: false,
        })
    }
}

#[async_trait::async_trait]
impl Tool for TestTool {
    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn get_description(&self) -> String {
        "test fixture".to_string()
    }

    fn get_parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } }
        })
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        self.xml.then(|| XmlBinding::new(&self.name))
    }

    async fn execute(
        &self,
        _call: ToolCall,
        _context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(AgentError::ToolExecution("flaky exploded".to_string()))
        } else {
            Ok(json!("3 results"))
        }
    }
}

/// Publishes STOP on its own run's control channel, then lingers long
/// enough for the control listener to flip the flag.
#[derive(Debug)]
struct StopperTool {
    pubsub: Arc<InMemoryPubSub>,
}

#[async_trait::async_trait]
impl Tool for StopperTool {
    fn get_name(&self) -> String {
        "stopper".to_string()
    }

    fn get_description(&self) -> String {
        "test fixture that stops its own run".to_string()
    }

    fn get_parameters(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(
        &self,
        _call: ToolCall,
        context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        self.pubsub
            .send_control(context.run_id, ControlSignal::Stop, None)
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        Ok(json!("stopping"))
    }
}

struct Harness {
    store: Arc<InMemoryMessageStore>,
    pubsub: Arc<InMemoryPubSub>,
    orchestrator: Arc<RunOrchestrator>,
    thread_id: Uuid,
    run_id: Uuid,
    submission: RunSubmission,
}

impl Harness {
    async fn frames(&self) -> Vec<Value> {
        self.pubsub.replay(self.run_id, 0).await.unwrap()
    }

    async fn run_status(&self) -> RunStatus {
        self.store.get_run(self.run_id).await.unwrap().status
    }

    async fn llm_message_types(&self) -> Vec<MessageType> {
        self.store
            .list_llm_messages(self.thread_id)
            .await
            .unwrap()
            .iter()
            .map(|m| m.message_type)
            .collect()
    }
}

async fn setup(
    llm: Arc<MockLlm>,
    extra_tools: Vec<Arc<dyn Tool>>,
    config: RuntimeConfig,
) -> Harness {
    let store = Arc::new(InMemoryMessageStore::for_demo());
    let pubsub = Arc::new(InMemoryPubSub::default());
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

    let mut tools = get_builtin_tools(false);
    tools.extend(extra_tools);
    let registry = Arc::new(ToolRegistry::with_tools(tools).unwrap());

    let orchestrator = Arc::new(RunOrchestrator::new(
        store.clone(),
        pubsub.clone(),
        registry,
        llm,
        config,
    ));

    let submission = RunSubmission {
        agent_run_id: run_id,
        thread_id: thread.thread_id,
        project_id: None,
        model_name: "gpt-4o".to_string(),
        enable_thinking: false,
        reasoning_effort: Default::default(),
        stream: false,
        enable_context_manager: false,
        user_id: None,
    };

    Harness {
        store,
        pubsub,
        orchestrator,
        thread_id: thread.thread_id,
        run_id,
        submission,
    }
}

fn count_status(frames: &[Value], status_type: &str) -> usize {
    frames
        .iter()
        .filter(|f| f["status_type"] == status_type)
        .count()
}

#[tokio::test]
async fn simple_question_round_trip() {
    let llm = Arc::new(MockLlm::new(vec![MockLlm::answer("Paris.")]));
    let harness = setup(llm.clone(), Vec::new(), RuntimeConfig::default()).await;
    harness
        .store
        .append_message(
            harness.thread_id,
            NewMessage::user("What is the capital of France?"),
        )
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    assert_eq!(
        harness.llm_message_types().await,
        vec![MessageType::User, MessageType::Assistant]
    );
    assert_eq!(harness.run_status().await, RunStatus::Completed);

    let frames = harness.frames().await;
    assert_eq!(count_status(&frames, "thread_run_start"), 1);
    assert_eq!(count_status(&frames, "assistant_response_start"), 1);
    assert_eq!(count_status(&frames, "thread_run_end"), 1);
    let assistant_payloads: Vec<&Value> = frames
        .iter()
        .filter(|f| f["type"] == "assistant")
        .collect();
    assert_eq!(assistant_payloads.len(), 1);
    assert_eq!(assistant_payloads[0]["content"]["content"], "Paris.");
    // Every frame of this run is tagged with its id.
    for frame in &frames {
        assert_eq!(
            frame["metadata"]["thread_run_id"],
            harness.run_id.to_string()
        );
    }
    // The end frame is last.
    assert_eq!(frames.last().unwrap()["status_type"], "thread_run_end");
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn native_tool_use_auto_continues() {
    let calls = Arc::new(AtomicUsize::new(0));
    let llm = Arc::new(MockLlm::new(vec![
        MockLlm::tool_call_turn(
            "Searching now.",
            vec![MockLlm::native_call(
                "c1",
                "search",
                json!({"query": "AI news"}),
            )],
        ),
        MockLlm::answer("Here is what I found about AI news."),
    ]));
    let harness = setup(
        llm.clone(),
        vec![TestTool::search(calls.clone())],
        RuntimeConfig::default(),
    )
    .await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("Search 'AI news'"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    assert_eq!(harness.run_status().await, RunStatus::Completed);
    assert_eq!(llm.call_count(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let llm_messages = harness.store.list_llm_messages(harness.thread_id).await.unwrap();
    let last = llm_messages.last().unwrap();
    assert_eq!(last.message_type, MessageType::Assistant);
    assert_eq!(
        last.as_text().unwrap(),
        "Here is what I found about AI news."
    );
    // The tool message carries the originating call id.
    let tool_message = llm_messages
        .iter()
        .find(|m| m.message_type == MessageType::Tool)
        .unwrap();
    assert_eq!(tool_message.tool_results()[0].tool_call_id, "c1");

    let frames = harness.frames().await;
    let started_index = frames
        .iter()
        .position(|f| f["status_type"] == "tool_started")
        .unwrap();
    let completed_index = frames
        .iter()
        .position(|f| f["status_type"] == "tool_completed")
        .unwrap();
    assert!(started_index < completed_index);
    assert_eq!(frames[completed_index]["content"]["tool_call_id"], "c1");
}

#[tokio::test]
async fn xml_tool_calls_respect_the_cap() {
    let calls = Arc::new(AtomicUsize::new(0));
    let content = "<search><query>a</query></search>\
                   <search><query>b</query></search>\
                   <search><query>c</query></search>";
    let llm = Arc::new(MockLlm::new(vec![MockLlm::answer(content)]));
    let config = RuntimeConfig {
        max_xml_tool_calls: 2,
        ..RuntimeConfig::default()
    };
    let harness = setup(llm.clone(), vec![TestTool::search(calls.clone())], config).await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("search three things"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    // Exactly two invocations, in order of appearance, and no auto-continue.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(llm.call_count(), 1);
    assert_eq!(harness.run_status().await, RunStatus::Completed);

    let frames = harness.frames().await;
    assert_eq!(count_status(&frames, "thread_run_end"), 1);
    let end = frames.last().unwrap();
    assert_eq!(end["status_type"], "thread_run_end");
    assert_eq!(end["content"]["finish_reason"], "xml_tool_limit_reached");
}

#[tokio::test]
async fn complete_tool_terminates_the_run() {
    let llm = Arc::new(MockLlm::new(vec![MockLlm::tool_call_turn(
        "",
        vec![MockLlm::native_call(
            "c1",
            "complete",
            json!({"text": "All done."}),
        )],
    )]));
    let harness = setup(llm.clone(), Vec::new(), RuntimeConfig::default()).await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("finish up"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    assert_eq!(harness.run_status().await, RunStatus::Completed);
    assert_eq!(llm.call_count(), 1);

    let frames = harness.frames().await;
    let completed: Vec<&Value> = frames
        .iter()
        .filter(|f| f["status_type"] == "tool_completed")
        .collect();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0]["content"]["tool_name"], "complete");
    assert_eq!(completed[0]["metadata"]["agent_should_terminate"], true);

    // The persisted tool message carries the terminate marker too.
    let llm_messages = harness.store.list_llm_messages(harness.thread_id).await.unwrap();
    let tool_message = llm_messages
        .iter()
        .find(|m| m.message_type == MessageType::Tool)
        .unwrap();
    assert_eq!(tool_message.metadata["agent_should_terminate"], true);
}

#[tokio::test]
async fn ask_stops_awaiting_user_input() {
    let llm = Arc::new(MockLlm::new(vec![MockLlm::tool_call_turn(
        "",
        vec![MockLlm::native_call(
            "c1",
            "ask",
            json!({"text": "Which database?"}),
        )],
    )]));
    let harness = setup(llm.clone(), Vec::new(), RuntimeConfig::default()).await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("set it up"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    let run = harness.store.get_run(harness.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Stopped);
    assert_eq!(run.error.as_deref(), Some("awaiting user input"));
    assert!(run.completed_at.is_some());
}

#[tokio::test]
async fn stop_signal_ends_the_run_between_iterations() {
    // The model would keep calling tools forever; the stopper tool fires a
    // STOP on the run's control channel during iteration one.
    let mut responses = Vec::new();
    for _ in 0..5 {
        responses.push(MockLlm::tool_call_turn(
            "",
            vec![MockLlm::native_call("c1", "stopper", json!({}))],
        ));
    }
    let llm = Arc::new(MockLlm::new(responses));

    let store = Arc::new(InMemoryMessageStore::for_demo());
    let pubsub = Arc::new(InMemoryPubSub::default());
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
    let mut tools = get_builtin_tools(false);
    tools.push(Arc::new(StopperTool {
        pubsub: pubsub.clone(),
    }));
    let registry = Arc::new(ToolRegistry::with_tools(tools).unwrap());
    let orchestrator = Arc::new(RunOrchestrator::new(
        store.clone(),
        pubsub.clone(),
        registry,
        llm.clone(),
        RuntimeConfig::default(),
    ));
    store
        .append_message(thread.thread_id, NewMessage::user("loop forever"))
        .await
        .unwrap();

    orchestrator
        .execute_run(RunSubmission {
            agent_run_id: run_id,
            thread_id: thread.thread_id,
            project_id: None,
            model_name: "gpt-4o".to_string(),
            enable_thinking: false,
            reasoning_effort: Default::default(),
            stream: false,
            enable_context_manager: false,
            user_id: None,
        })
        .await
        .unwrap();

    // The in-flight iteration ran to completion, then no further iteration
    // started.
    assert_eq!(llm.call_count(), 1);
    assert_eq!(
        store.get_run(run_id).await.unwrap().status,
        RunStatus::Stopped
    );
    let frames = pubsub.replay(run_id, 0).await.unwrap();
    let end = frames.last().unwrap();
    assert_eq!(end["status_type"], "thread_run_end");
    assert_eq!(end["content"]["status"], "stopped");
}

#[tokio::test]
async fn summarization_triggers_and_prefixes_the_prompt() {
    let llm = Arc::new(MockLlm::new(vec![
        MockLlm::answer("A factual, chronological summary of everything so far."),
        MockLlm::answer("Continuing from the summary."),
    ]));
    let config = RuntimeConfig {
        context_token_threshold: 10,
        ..RuntimeConfig::default()
    };
    let harness = setup(llm.clone(), Vec::new(), config).await;
    for text in [
        "first message with quite a few words in it",
        "second message also containing several words",
        "third message to push the estimate over the threshold",
    ] {
        harness
            .store
            .append_message(harness.thread_id, NewMessage::user(text))
            .await
            .unwrap();
    }

    let mut submission = harness.submission.clone();
    submission.enable_context_manager = true;
    harness.orchestrator.execute_run(submission).await.unwrap();

    assert_eq!(llm.call_count(), 2);

    // Exactly one summary message, LLM-visible, with the estimated count.
    let all = harness.store.list_messages(harness.thread_id).await.unwrap();
    let summaries: Vec<_> = all
        .iter()
        .filter(|m| m.message_type == MessageType::Summary)
        .collect();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].is_llm_message);
    assert!(summaries[0].metadata["token_count"].as_u64().unwrap() >= 10);

    // The runner's own call saw [system, summary, ...] as its prompt.
    let requests = llm.requests.lock().unwrap();
    let prompt = &requests[1].messages;
    assert_eq!(prompt[0].message_type, MessageType::System);
    assert_eq!(prompt[1].message_type, MessageType::Summary);
}

#[tokio::test]
async fn context_check_is_idempotent_below_threshold() {
    use crate::context::{ContextConfig, ContextManager};

    let llm = Arc::new(MockLlm::new(Vec::new()));
    let store = Arc::new(InMemoryMessageStore::for_demo());
    let thread = store.create_thread(None, DEMO_ACCOUNT_ID).await.unwrap();
    store
        .append_message(thread.thread_id, NewMessage::user("short"))
        .await
        .unwrap();

    let manager = ContextManager::new(store.clone(), llm.clone(), ContextConfig::default());
    for _ in 0..3 {
        let summarized = manager
            .check_and_summarize_if_needed(thread.thread_id, "gpt-4o", false)
            .await
            .unwrap();
        assert!(!summarized);
    }
    // No LLM call and no writes happened.
    assert_eq!(llm.call_count(), 0);
    assert_eq!(store.list_messages(thread.thread_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_tool_does_not_kill_the_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let llm = Arc::new(MockLlm::new(vec![
        MockLlm::tool_call_turn(
            "",
            vec![MockLlm::native_call("c1", "flaky", json!({}))],
        ),
        MockLlm::answer("Recovered after the tool failure."),
    ]));
    let harness = setup(
        llm.clone(),
        vec![TestTool::failing(calls.clone())],
        RuntimeConfig::default(),
    )
    .await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("try the flaky tool"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    assert_eq!(harness.run_status().await, RunStatus::Completed);
    assert_eq!(llm.call_count(), 2);

    let frames = harness.frames().await;
    assert_eq!(count_status(&frames, "tool_failed"), 1);
    assert_eq!(count_status(&frames, "tool_completed"), 0);

    // The next iteration's prompt contained the failure string.
    let requests = llm.requests.lock().unwrap();
    let second_prompt = &requests[1].messages;
    let failure_visible = second_prompt.iter().any(|m| {
        m.message_type == MessageType::Tool
            && m.tool_results()
                .iter()
                .any(|r| !r.success && r.output.to_string().contains("flaky exploded"))
    });
    assert!(failure_visible);
}

#[tokio::test]
async fn empty_thread_still_frames_the_run() {
    let llm = Arc::new(MockLlm::new(vec![MockLlm::answer("Hello!")]));
    let harness = setup(llm, Vec::new(), RuntimeConfig::default()).await;

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    let frames = harness.frames().await;
    assert_eq!(count_status(&frames, "thread_run_start"), 1);
    assert_eq!(count_status(&frames, "thread_run_end"), 1);
    assert_eq!(harness.run_status().await, RunStatus::Completed);
}

#[tokio::test]
async fn streaming_publishes_delta_frames() {
    let llm = Arc::new(MockLlm::new(vec![MockLlm::answer("Paris.")]));
    let harness = setup(llm, Vec::new(), RuntimeConfig::default()).await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("capital of France?"))
        .await
        .unwrap();

    let mut submission = harness.submission.clone();
    submission.stream = true;
    harness.orchestrator.execute_run(submission).await.unwrap();

    let frames = harness.frames().await;
    let deltas: Vec<String> = frames
        .iter()
        .filter(|f| f["metadata"]["streaming"] == true)
        .filter_map(|f| f["content"]["delta"].as_str().map(str::to_string))
        .collect();
    assert!(!deltas.is_empty());
    assert_eq!(deltas.concat(), "Paris.");
    assert_eq!(harness.run_status().await, RunStatus::Completed);
}

#[tokio::test]
async fn iteration_limit_completes_with_a_note() {
    let mut responses = Vec::new();
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        responses.push(MockLlm::tool_call_turn(
            "",
            vec![MockLlm::native_call("c1", "search", json!({"query": "x"}))],
        ));
    }
    let llm = Arc::new(MockLlm::new(responses));
    let config = RuntimeConfig {
        max_iterations: 1,
        native_max_auto_continues: 0,
        ..RuntimeConfig::default()
    };
    let harness = setup(llm.clone(), vec![TestTool::search(calls)], config).await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("never stop"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    assert_eq!(harness.run_status().await, RunStatus::Completed);
    assert_eq!(llm.call_count(), 1);
    let frames = harness.frames().await;
    let end = frames.last().unwrap();
    assert_eq!(end["content"]["message"], "reached maximum iterations");
}

#[tokio::test]
async fn lease_holder_excludes_other_instances() {
    let llm = Arc::new(MockLlm::new(vec![MockLlm::answer("should not run")]));
    let harness = setup(llm.clone(), Vec::new(), RuntimeConfig::default()).await;
    harness
        .pubsub
        .acquire_lease(
            harness.run_id,
            "someone-else",
            std::time::Duration::from_secs(60),
        )
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    // No action: no LLM call, run still pending, nothing streamed.
    assert_eq!(llm.call_count(), 0);
    assert_eq!(harness.run_status().await, RunStatus::Pending);
    assert!(harness.frames().await.is_empty());
}

#[tokio::test]
async fn parallel_tools_report_in_index_order() {
    let calls = Arc::new(AtomicUsize::new(0));
    let llm = Arc::new(MockLlm::new(vec![
        MockLlm::tool_call_turn(
            "",
            vec![
                MockLlm::native_call("c1", "search", json!({"query": "a"})),
                MockLlm::native_call("c2", "search", json!({"query": "b"})),
            ],
        ),
        MockLlm::answer("both done"),
    ]));
    let config = RuntimeConfig {
        tool_execution_strategy: ToolExecutionStrategy::Parallel,
        ..RuntimeConfig::default()
    };
    let harness = setup(llm, vec![TestTool::search(calls.clone())], config).await;
    harness
        .store
        .append_message(harness.thread_id, NewMessage::user("two searches"))
        .await
        .unwrap();

    harness
        .orchestrator
        .execute_run(harness.submission.clone())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let frames = harness.frames().await;
    let completion_ids: Vec<String> = frames
        .iter()
        .filter(|f| f["status_type"] == "tool_completed")
        .filter_map(|f| f["content"]["tool_call_id"].as_str().map(str::to_string))
        .collect();
    assert_eq!(completion_ids, vec!["c1", "c2"]);
}
