//! The agent execution engine: tool registry and dispatch, LLM provider
//! abstraction, context-window management, the per-iteration thread runner,
//! and the run orchestrator that drives background execution with pub/sub
//! streaming and cooperative cancellation.

pub mod billing;
pub mod context;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod sandbox;
pub mod tools;

#[cfg(test)]
mod tests;

pub use billing::TracingUsageRecorder;
pub use context::{ContextConfig, ContextManager, TokenEstimator};
pub use llm::{
    ChunkStream, FinishReason, LlmClient, LlmRequest, LlmResponse, OpenAiCompatLlm,
    ProviderConfig, StreamEvent, ToolChoice,
};
pub use orchestrator::{AgentOptions, RunOrchestrator, RunRegistry, TODO_FILE};
pub use queue::InMemoryWorkQueue;
pub use runner::{IterationOutcome, ThreadRunner, ThreadRunnerConfig};
pub use sandbox::LocalSandbox;
pub use tools::{builtin::get_builtin_tools, ToolRegistry, TERMINATING_TOOLS};
