use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Status frame type names used on the per-run event channel.
pub mod status_types {
    pub const THREAD_RUN_START: &str = "thread_run_start";
    pub const ASSISTANT_RESPONSE_START: &str = "assistant_response_start";
    pub const TOOL_STARTED: &str = "tool_started";
    pub const TOOL_COMPLETED: &str = "tool_completed";
    pub const TOOL_FAILED: &str = "tool_failed";
    pub const TOOL_ERROR: &str = "tool_error";
    pub const THREAD_RUN_END: &str = "thread_run_end";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Status,
    Assistant,
    Tool,
}

/// JSON payload published on `run:{run_id}:events`. `metadata.thread_run_id`
/// is always set while a run is active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub content: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl EventFrame {
    pub fn status(status_type: &str, content: Value) -> Self {
        Self {
            frame_type: FrameType::Status,
            status_type: Some(status_type.to_string()),
            role: None,
            content,
            metadata: Map::new(),
        }
    }

    pub fn assistant(content: Value) -> Self {
        Self {
            frame_type: FrameType::Assistant,
            status_type: None,
            role: Some("assistant".to_string()),
            content,
            metadata: Map::new(),
        }
    }

    pub fn tool(content: Value) -> Self {
        Self {
            frame_type: FrameType::Tool,
            status_type: None,
            role: Some("tool".to_string()),
            content,
            metadata: Map::new(),
        }
    }

    pub fn with_thread_run_id(mut self, run_id: Uuid) -> Self {
        self.metadata.insert(
            "thread_run_id".to_string(),
            Value::String(run_id.to_string()),
        );
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Control signals delivered on `run:{run_id}:control[:instance]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlSignal {
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "ERROR")]
    Error,
}

pub fn events_channel(run_id: Uuid) -> String {
    format!("run:{run_id}:events")
}

pub fn control_channel(run_id: Uuid) -> String {
    format!("run:{run_id}:control")
}

pub fn instance_control_channel(run_id: Uuid, instance_id: &str) -> String {
    format!("run:{run_id}:control:{instance_id}")
}

pub fn lease_key(run_id: Uuid, instance_id: &str) -> String {
    format!("active_run:{instance_id}:{run_id}")
}
