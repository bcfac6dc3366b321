use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Append-only conversation log owned by a project/account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thread {
    pub thread_id: Uuid,
    pub project_id: Option<Uuid>,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    User,
    Assistant,
    Tool,
    Status,
    Summary,
    System,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::User => "user",
            MessageType::Assistant => "assistant",
            MessageType::Tool => "tool",
            MessageType::Status => "status",
            MessageType::Summary => "summary",
            MessageType::System => "system",
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = crate::errors::AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(MessageType::User),
            "assistant" => Ok(MessageType::Assistant),
            "tool" => Ok(MessageType::Tool),
            "status" => Ok(MessageType::Status),
            "summary" => Ok(MessageType::Summary),
            "system" => Ok(MessageType::System),
            other => Err(crate::errors::AgentError::Validation(format!(
                "unknown message type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallKind {
    #[default]
    Native,
    Xml,
}

/// A tool invocation extracted from an assistant response. The id is stable
/// across streaming chunks for native calls; XML calls get synthetic ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ToolCall {
    pub id: String,
    #[serde(default)]
    pub kind: ToolCallKind,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn native(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            kind: ToolCallKind::Native,
            name: name.into(),
            arguments,
        }
    }

    pub fn xml(seq: usize, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: format!("xml-{seq}"),
            kind: ToolCallKind::Xml,
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a tool invocation, carried in `tool`-typed messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ToolResult {
    pub tool_call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_message_id: Option<String>,
    pub success: bool,
    pub output: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "snake_case", tag = "part_type", content = "data")]
pub enum ContentPart {
    Text(String),
    ImageUrl(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
}

/// Message content is either a plain string or an ordered list of typed
/// parts; both shapes are persisted verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<String> {
        match self {
            MessageContent::Text(text) => Some(text.clone()),
            MessageContent::Parts(parts) => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text(text) => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
        }
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolCall(call) => Some(call.clone()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn tool_results(&self) -> Vec<ToolResult> {
        match self {
            MessageContent::Text(_) => Vec::new(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::ToolResult(result) => Some(result.clone()),
                    _ => None,
                })
                .collect(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/// A persisted message. Messages are append-only; ordering within a thread is
/// by creation timestamp with insertion order as tiebreaker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: Uuid,
    pub thread_id: Uuid,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: MessageContent,
    pub is_llm_message: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn as_text(&self) -> Option<String> {
        self.content.as_text()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content.tool_calls()
    }

    pub fn tool_results(&self) -> Vec<ToolResult> {
        self.content.tool_results()
    }
}

/// Payload for `MessageStore::append_message`; id and timestamp are assigned
/// by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub content: MessageContent,
    pub is_llm_message: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl NewMessage {
    pub fn new(message_type: MessageType, content: impl Into<MessageContent>) -> Self {
        Self {
            message_type,
            content: content.into(),
            is_llm_message: matches!(
                message_type,
                MessageType::User
                    | MessageType::Assistant
                    | MessageType::Tool
                    | MessageType::Summary
                    | MessageType::System
            ),
            metadata: Map::new(),
        }
    }

    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageType::User, content)
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageType::Assistant, content)
    }

    pub fn status(content: impl Into<MessageContent>) -> Self {
        Self::new(MessageType::Status, content)
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_is_llm_message(mut self, is_llm_message: bool) -> Self {
        self.is_llm_message = is_llm_message;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_content_round_trips_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text("look at this".to_string()),
            ContentPart::ImageUrl("https://example.com/cat.png".to_string()),
            ContentPart::ToolCall(ToolCall::native("c1", "search", json!({"query": "cats"}))),
            ContentPart::ToolResult(ToolResult {
                tool_call_id: "c1".to_string(),
                assistant_message_id: None,
                success: true,
                output: json!("ok"),
            }),
        ]);

        let serialized = serde_json::to_string(&content).unwrap();
        let parsed: MessageContent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(content, parsed);
    }

    #[test]
    fn message_content_round_trips_text() {
        let content = MessageContent::Text("plain".to_string());
        let serialized = serde_json::to_string(&content).unwrap();
        let parsed: MessageContent = serde_json::from_str(&serialized).unwrap();
        assert_eq!(content, parsed);
    }

    #[test]
    fn xml_tool_call_ids_are_synthetic() {
        let call = ToolCall::xml(3, "search", json!({}));
        assert_eq!(call.id, "xml-3");
        assert_eq!(call.kind, ToolCallKind::Xml);
    }

    #[test]
    fn as_text_joins_text_parts() {
        let content = MessageContent::Parts(vec![
            ContentPart::Text("a".to_string()),
            ContentPart::ImageUrl("http://x/y.png".to_string()),
            ContentPart::Text("b".to_string()),
        ]);
        assert_eq!(content.as_text().unwrap(), "a\nb");
    }
}
