use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::ToolCall;
use crate::errors::AgentError;
use crate::stores::SandboxFs;

/// Machine-readable description of a tool exported to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum XmlValueType {
    #[default]
    String,
    Int,
    Float,
    Boolean,
    Json,
}

impl XmlValueType {
    /// Coerce a raw XML string to the declared type; on parse failure the raw
    /// string is kept so the tool still sees the model's output.
    pub fn coerce(&self, raw: &str) -> Value {
        let trimmed = raw.trim();
        match self {
            XmlValueType::String => Value::String(raw.to_string()),
            XmlValueType::Int => trimmed
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            XmlValueType::Float => trimmed
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string())),
            XmlValueType::Boolean => trimmed
                .parse::<bool>()
                .map(Value::Bool)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
            XmlValueType::Json => serde_json::from_str(trimmed)
                .unwrap_or_else(|_| Value::String(raw.to_string())),
        }
    }
}

/// Where an XML-bound parameter reads its raw string from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "source", content = "value")]
pub enum XmlSource {
    /// `element.attributes[name]`.
    Attribute(String),
    /// Text of the first descendant with the given tag name.
    Element(String),
    /// Trimmed text content of the element itself.
    Content,
    /// The raw XML chunk, verbatim.
    Root,
    /// Restricted child-axis path (`a/b/c`); see DESIGN.md.
    XPath(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct XmlField {
    pub param_name: String,
    #[serde(flatten)]
    pub source: XmlSource,
    #[serde(default)]
    pub value_type: XmlValueType,
}

impl XmlField {
    pub fn attribute(param_name: &str, attr: &str) -> Self {
        Self {
            param_name: param_name.to_string(),
            source: XmlSource::Attribute(attr.to_string()),
            value_type: XmlValueType::String,
        }
    }

    pub fn element(param_name: &str, path: &str) -> Self {
        Self {
            param_name: param_name.to_string(),
            source: XmlSource::Element(path.to_string()),
            value_type: XmlValueType::String,
        }
    }

    pub fn content(param_name: &str) -> Self {
        Self {
            param_name: param_name.to_string(),
            source: XmlSource::Content,
            value_type: XmlValueType::String,
        }
    }

    pub fn with_value_type(mut self, value_type: XmlValueType) -> Self {
        self.value_type = value_type;
        self
    }
}

/// How an XML element embedded in assistant text maps to an argument map.
/// An empty field list means "infer arguments from child elements".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct XmlBinding {
    pub tag_name: String,
    #[serde(default)]
    pub fields: Vec<XmlField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

impl XmlBinding {
    pub fn new(tag_name: &str) -> Self {
        Self {
            tag_name: tag_name.to_string(),
            fields: Vec::new(),
            example: None,
        }
    }

    pub fn with_field(mut self, field: XmlField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_example(mut self, example: &str) -> Self {
        self.example = Some(example.to_string());
        self
    }
}

/// Result of a tool invocation. Failures are values, not errors; the loop
/// continues after a failed tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: Value,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::String(message.into()),
        }
    }

    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Per-invocation context handed to tool bodies.
#[derive(Clone)]
pub struct ToolContext {
    pub thread_id: Uuid,
    pub run_id: Uuid,
    pub sandbox: Option<Arc<dyn SandboxFs>>,
    pub metadata: HashMap<String, String>,
}

impl ToolContext {
    pub fn new(thread_id: Uuid, run_id: Uuid) -> Self {
        Self {
            thread_id,
            run_id,
            sandbox: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn SandboxFs>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }
}

impl std::fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolContext")
            .field("thread_id", &self.thread_id)
            .field("run_id", &self.run_id)
            .field("has_sandbox", &self.sandbox.is_some())
            .finish()
    }
}

/// A named function with a declared parameter schema, callable by the LLM.
#[async_trait::async_trait]
pub trait Tool: Send + Sync + std::fmt::Debug {
    fn get_name(&self) -> String;

    fn get_description(&self) -> String;

    /// OpenAPI-style JSON schema of the parameters object.
    fn get_parameters(&self) -> Value;

    /// Optional mapping from an XML tag embedded in assistant text.
    fn xml_binding(&self) -> Option<XmlBinding> {
        None
    }

    /// Terminating tools end the run when they execute successfully.
    fn is_terminating(&self) -> bool {
        false
    }

    async fn execute(
        &self,
        tool_call: ToolCall,
        context: Arc<ToolContext>,
    ) -> Result<Value, AgentError>;
}
