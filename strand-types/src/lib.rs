pub mod configuration;
pub mod core;
pub mod errors;
pub mod events;
pub mod runs;
pub mod stores;
pub mod tool;

pub use configuration::{
    RedisSettings, RuntimeConfig, StoreBackendKind, StoreConfig, ToolExecutionStrategy,
};
pub use core::{
    ContentPart, Message, MessageContent, MessageType, NewMessage, Thread, ToolCall, ToolCallKind,
    ToolResult,
};
pub use errors::AgentError;
pub use events::{status_types, ControlSignal, EventFrame, FrameType};
pub use runs::{AgentRun, NewAgentRun, ReasoningEffort, RunStatus, RunSubmission};
pub use stores::{
    AccountDirectory, CommandOutput, MessageStore, PubSub, SandboxFs, Subscription, UsageRecord,
    UsageRecorder, WorkQueue, DEMO_ACCOUNT_ID,
};
pub use tool::{
    Tool, ToolContext, ToolOutcome, ToolSchema, XmlBinding, XmlField, XmlSource, XmlValueType,
};
