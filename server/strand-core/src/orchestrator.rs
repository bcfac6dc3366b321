use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use strand_types::{
    events::{control_channel, instance_control_channel},
    status_types, AgentError, ControlSignal, MessageStore, PubSub, RunStatus, RunSubmission,
    RuntimeConfig, SandboxFs,
};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::context::{ContextConfig, ContextManager};
use crate::llm::{BillingContext, FinishReason, LlmClient};
use crate::runner::{RunEmitter, ThreadRunner, ThreadRunnerConfig};
use crate::tools::ToolRegistry;

/// Sandbox file carrying the agent's working plan between iterations.
pub const TODO_FILE: &str = "todo.md";

static TODO_UPDATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)<todo_update>(.*?)</todo_update>").expect("static regex"));

/// Per-run cooperative stop flags, keyed by run id. One registry per
/// process; created at startup, drained at shutdown.
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<Uuid, Arc<AtomicBool>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, run_id: Uuid) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.runs.insert(run_id, flag.clone());
        flag
    }

    fn remove(&self, run_id: Uuid) {
        self.runs.remove(&run_id);
    }

    /// Requests a cooperative stop; returns false when the run is not
    /// executing on this instance.
    pub fn stop(&self, run_id: Uuid) -> bool {
        match self.runs.get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs.iter().map(|entry| *entry.key()).collect()
    }

    /// Sets every stop flag; used for process shutdown.
    pub fn shutdown(&self) {
        for entry in self.runs.iter() {
            entry.value().store(true, Ordering::Relaxed);
        }
    }
}

/// Agent-level settings that do not arrive on the submission envelope.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub native_tool_calling: bool,
    pub xml_tool_calling: bool,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful AI assistant.".to_string(),
            temperature: 0.0,
            max_tokens: None,
            native_tool_calling: true,
            xml_tool_calling: true,
        }
    }
}

/// Drives ThreadRunner until completion: lease, control channels, the
/// iteration bound, todo.md round-tripping, and the run-status lifecycle.
pub struct RunOrchestrator {
    store: Arc<dyn MessageStore>,
    pubsub: Arc<dyn PubSub>,
    tools: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    config: RuntimeConfig,
    registry: Arc<RunRegistry>,
    instance_id: String,
    sandbox: Option<Arc<dyn SandboxFs>>,
    options: AgentOptions,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        pubsub: Arc<dyn PubSub>,
        tools: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            store,
            pubsub,
            tools,
            llm,
            config,
            registry: Arc::new(RunRegistry::new()),
            instance_id: format!("worker-{}", Uuid::new_v4()),
            sandbox: None,
            options: AgentOptions::default(),
        }
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxFs>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn with_options(mut self, options: AgentOptions) -> Self {
        self.options = options;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn run_registry(&self) -> Arc<RunRegistry> {
        self.registry.clone()
    }

    /// Publishes a STOP signal on the run's global control channel.
    pub async fn request_stop(&self, run_id: Uuid) -> Result<(), AgentError> {
        self.pubsub
            .send_control(run_id, ControlSignal::Stop, None)
            .await
    }

    /// Runs each submission on its own worker task.
    pub fn spawn_run(self: &Arc<Self>, submission: RunSubmission) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            let run_id = submission.agent_run_id;
            if let Err(e) = orchestrator.execute_run(submission).await {
                tracing::error!(run_id = %run_id, "run worker failed: {e}");
            }
        })
    }

    /// Executes one run to a terminal state. Returns without action when
    /// another instance holds the lease.
    pub async fn execute_run(&self, submission: RunSubmission) -> Result<(), AgentError> {
        let run_id = submission.agent_run_id;
        let lease_ttl = self.config.redis_key_ttl;
        if !self
            .pubsub
            .acquire_lease(run_id, &self.instance_id, lease_ttl)
            .await?
        {
            tracing::info!(run_id = %run_id, "lease held by another instance, skipping");
            return Ok(());
        }

        let stop = self.registry.register(run_id);
        let result = self.drive(&submission, stop).await;
        self.registry.remove(run_id);
        if let Err(e) = self
            .pubsub
            .release_lease(run_id, &self.instance_id)
            .await
        {
            tracing::warn!(run_id = %run_id, "failed to release lease: {e}");
        }
        result
    }

    async fn drive(
        &self,
        submission: &RunSubmission,
        stop: Arc<AtomicBool>,
    ) -> Result<(), AgentError> {
        let run_id = submission.agent_run_id;
        let thread_id = submission.thread_id;

        self.store
            .set_run_status(run_id, RunStatus::Running, None, None)
            .await?;

        let control_listeners = self.spawn_control_listeners(run_id, stop.clone()).await?;
        let lease_refresher = self.spawn_lease_refresher(run_id, stop.clone());

        let mut runner = ThreadRunner::new(
            self.store.clone(),
            self.pubsub.clone(),
            self.tools.clone(),
            self.llm.clone(),
        );
        if submission.enable_context_manager {
            runner = runner.with_context_manager(Arc::new(ContextManager::new(
                self.store.clone(),
                self.llm.clone(),
                ContextConfig {
                    token_threshold: self.config.context_token_threshold,
                    summary_target_tokens: self.config.context_summary_target_tokens,
                    reserve_tokens: self.config.context_reserve_tokens,
                },
            )));
        }
        if let Some(sandbox) = &self.sandbox {
            runner = runner.with_sandbox(sandbox.clone());
        }

        let runner_config = ThreadRunnerConfig {
            system_prompt: self.options.system_prompt.clone(),
            model: submission.model_name.clone(),
            temperature: self.options.temperature,
            max_tokens: self.options.max_tokens,
            native_tool_calling: self.options.native_tool_calling,
            xml_tool_calling: self.options.xml_tool_calling,
            stream: submission.stream,
            enable_context_manager: submission.enable_context_manager,
            tool_strategy: self.config.tool_execution_strategy,
            max_xml_tool_calls: self.config.max_xml_tool_calls,
            native_max_auto_continues: self.config.native_max_auto_continues,
        };
        let billing = BillingContext {
            user_id: submission.user_id,
            run_id: Some(run_id),
        };

        let mut iteration: u32 = 0;
        let mut terminal = RunStatus::Completed;
        let mut terminal_error: Option<String> = None;
        let mut terminal_note: Option<String> = None;
        let mut last_finish: Option<FinishReason> = None;

        loop {
            if stop.load(Ordering::Relaxed) {
                terminal = RunStatus::Stopped;
                break;
            }
            if iteration >= self.config.max_iterations {
                terminal_note = Some("reached maximum iterations".to_string());
                break;
            }

            let temporary_message = self.read_todo().await;
            match runner
                .run(
                    thread_id,
                    run_id,
                    &runner_config,
                    temporary_message,
                    billing,
                    stop.clone(),
                )
                .await
            {
                Ok(outcome) => {
                    last_finish = outcome.finish_reason.clone();
                    self.apply_todo_update(&outcome.assistant_content).await;

                    if let Some(tool) = outcome.terminating_tool {
                        if tool == "complete" {
                            terminal = RunStatus::Completed;
                        } else {
                            terminal = RunStatus::Stopped;
                            terminal_error = Some("awaiting user input".to_string());
                        }
                        break;
                    }
                    if outcome.stopped {
                        terminal = RunStatus::Stopped;
                        break;
                    }
                    if !outcome.should_continue {
                        terminal = RunStatus::Completed;
                        break;
                    }
                    iteration += 1;
                }
                Err(e) => {
                    if matches!(e, AgentError::Cancelled(_)) {
                        terminal = RunStatus::Stopped;
                    } else {
                        tracing::error!(run_id = %run_id, "iteration failed: {e}");
                        terminal = RunStatus::Failed;
                        terminal_error = Some(e.summary());
                    }
                    break;
                }
            }
        }

        lease_refresher.abort();
        for listener in control_listeners {
            listener.abort();
        }

        self.store
            .set_run_status(
                run_id,
                terminal,
                terminal_error.clone(),
                Some(Utc::now()),
            )
            .await?;

        let emitter = RunEmitter::new(
            self.store.clone(),
            self.pubsub.clone(),
            thread_id,
            run_id,
        );
        let mut content = json!({ "status": terminal.as_str() });
        if let Value::Object(map) = &mut content {
            if let Some(finish) = &last_finish {
                map.insert("finish_reason".to_string(), json!(finish.as_str()));
            }
            if let Some(error) = &terminal_error {
                map.insert("message".to_string(), json!(error));
            } else if let Some(note) = &terminal_note {
                map.insert("message".to_string(), json!(note));
            }
        }
        emitter
            .status(status_types::THREAD_RUN_END, content)
            .await?;

        tracing::info!(
            run_id = %run_id,
            status = %terminal,
            iterations = iteration,
            "run finished"
        );
        Ok(())
    }

    async fn spawn_control_listeners(
        &self,
        run_id: Uuid,
        stop: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, AgentError> {
        let channels = [
            control_channel(run_id),
            instance_control_channel(run_id, &self.instance_id),
        ];
        let mut listeners = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut subscription = self.pubsub.subscribe(&channel).await?;
            let stop = stop.clone();
            listeners.push(tokio::spawn(async move {
                while let Some(payload) = subscription.recv().await {
                    if payload == json!("STOP") {
                        tracing::info!(run_id = %run_id, "stop signal received");
                        stop.store(true, Ordering::Relaxed);
                    }
                }
            }));
        }
        Ok(listeners)
    }

    /// Refreshes the lease at half its TTL. Losing the lease flips the stop
    /// flag so another instance can take over cleanly.
    fn spawn_lease_refresher(&self, run_id: Uuid, stop: Arc<AtomicBool>) -> JoinHandle<()> {
        let pubsub = self.pubsub.clone();
        let instance_id = self.instance_id.clone();
        let ttl = self.config.redis_key_ttl;
        tokio::spawn(async move {
            let interval = ttl / 2;
            loop {
                tokio::time::sleep(interval).await;
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                match pubsub.refresh_lease(run_id, &instance_id, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(run_id = %run_id, "lease lost, stopping run");
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, "lease refresh failed: {e}");
                    }
                }
            }
        })
    }

    async fn read_todo(&self) -> Option<String> {
        let sandbox = self.sandbox.as_ref()?;
        match sandbox.read_file(TODO_FILE).await {
            Ok(Some(contents)) if !contents.trim().is_empty() => Some(format!(
                "Current contents of {TODO_FILE}:\n\n{contents}"
            )),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("failed to read {TODO_FILE}: {e}");
                None
            }
        }
    }

    /// Writes a `<todo_update>` block from assistant output back to the
    /// sandbox.
    async fn apply_todo_update(&self, assistant_content: &str) {
        let Some(sandbox) = &self.sandbox else {
            return;
        };
        let Some(update) = TODO_UPDATE_RE
            .captures(assistant_content)
            .and_then(|captures| captures.get(1))
        else {
            return;
        };
        if let Err(e) = sandbox.write_file(TODO_FILE, update.as_str().trim()).await {
            tracing::warn!("failed to write {TODO_FILE}: {e}");
        }
    }
}
