pub mod builtin;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use strand_types::{
    AgentError, Tool, ToolCall, ToolContext, ToolOutcome, ToolSchema, XmlBinding,
};

/// Tool names that end the run when they execute successfully.
pub const TERMINATING_TOOLS: &[&str] = &["ask", "complete", "web-browser-takeover"];

static TOOL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

/// Name, XML-tag, and invocation index over the registered tools. Built once
/// at startup, immutable afterwards; lookups are lock-free.
#[derive(Default)]
pub struct ToolRegistry {
    native_index: HashMap<String, Arc<dyn Tool>>,
    xml_index: HashMap<String, (Arc<dyn Tool>, XmlBinding)>,
    order: Vec<String>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.order)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tools(tools: Vec<Arc<dyn Tool>>) -> Result<Self, AgentError> {
        let mut registry = Self::new();
        for tool in tools {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), AgentError> {
        let name = tool.get_name();
        if !TOOL_NAME_RE.is_match(&name) {
            return Err(AgentError::Validation(format!(
                "invalid tool name {name:?}: must match ^[A-Za-z0-9_-]{{1,64}}$"
            )));
        }
        if self.native_index.contains_key(&name) {
            return Err(AgentError::Validation(format!(
                "duplicate tool name {name:?}"
            )));
        }
        if let Some(binding) = tool.xml_binding() {
            if self.xml_index.contains_key(&binding.tag_name) {
                return Err(AgentError::Validation(format!(
                    "duplicate xml tag {:?}",
                    binding.tag_name
                )));
            }
            self.xml_index
                .insert(binding.tag_name.clone(), (tool.clone(), binding));
        }
        self.order.push(name.clone());
        self.native_index.insert(name, tool);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.native_index
            .get(name)
            .cloned()
            .or_else(|| self.xml_index.get(name).map(|(tool, _)| tool.clone()))
    }

    pub fn is_terminating(&self, name: &str) -> bool {
        self.get(name).map(|t| t.is_terminating()).unwrap_or(false)
    }

    /// XML tag -> binding map for the tool-call parser.
    pub fn xml_bindings(&self) -> HashMap<String, XmlBinding> {
        self.xml_index
            .iter()
            .map(|(tag, (_, binding))| (tag.clone(), binding.clone()))
            .collect()
    }

    /// XML tag -> example usage string, for prompt augmentation.
    pub fn xml_examples(&self) -> BTreeMap<String, String> {
        self.xml_index
            .iter()
            .filter_map(|(tag, (_, binding))| {
                binding.example.clone().map(|example| (tag.clone(), example))
            })
            .collect()
    }

    /// Exports tool schemas for the LLM request. This is the last line of
    /// defense: a tool with a broken schema is repaired or dropped with a
    /// warning, never allowed to corrupt the request.
    pub fn openai_schemas(&self) -> Vec<ToolSchema> {
        let mut schemas = Vec::with_capacity(self.order.len());
        let mut seen = std::collections::HashSet::new();
        for name in &self.order {
            let tool = &self.native_index[name];
            match export_schema(tool.as_ref()) {
                Some(schema) => {
                    if seen.insert(schema.name.clone()) {
                        schemas.push(schema);
                    } else {
                        tracing::warn!(tool = %schema.name, "dropping tool with colliding sanitized name");
                    }
                }
                None => {
                    tracing::warn!(tool = %name, "dropping tool with unusable schema");
                }
            }
        }
        schemas
    }

    /// Invokes a tool by name. Unknown tools and tool-body failures become
    /// failed outcomes; the agent loop continues either way.
    pub async fn invoke(&self, call: &ToolCall, context: Arc<ToolContext>) -> ToolOutcome {
        let Some(tool) = self.get(&call.name) else {
            return ToolOutcome::failed("tool not found");
        };

        let mut coerced = call.clone();
        coerced.arguments = coerce_arguments(&tool.get_parameters(), call.arguments.clone());

        match tool.execute(coerced, context).await {
            Ok(output) => ToolOutcome {
                success: true,
                output,
            },
            Err(e) => {
                tracing::warn!(tool = %call.name, "tool execution failed: {e}");
                ToolOutcome::failed(e.to_string())
            }
        }
    }
}

fn export_schema(tool: &dyn Tool) -> Option<ToolSchema> {
    let raw_name = tool.get_name();
    let name = if TOOL_NAME_RE.is_match(&raw_name) {
        raw_name
    } else {
        let sanitized: String = raw_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .take(64)
            .collect();
        if !TOOL_NAME_RE.is_match(&sanitized) {
            return None;
        }
        tracing::warn!(from = %raw_name, to = %sanitized, "sanitized tool name for export");
        sanitized
    };

    let description = {
        let description = tool.get_description();
        if description.trim().is_empty() {
            "No description provided".to_string()
        } else {
            description
        }
    };

    let parameters = repair_parameters(tool.get_parameters())?;
    Some(ToolSchema {
        name,
        description,
        parameters,
    })
}

/// Accepts only a valid object schema; wraps bare non-object schemas the way
/// providers expect and rejects anything that fails meta-validation.
fn repair_parameters(parameters: Value) -> Option<Value> {
    let parameters = match parameters {
        Value::Null => json!({"type": "object", "properties": {}}),
        Value::Object(map) => {
            let is_object_schema = map
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.eq_ignore_ascii_case("object"))
                .unwrap_or_else(|| map.contains_key("properties"));
            if is_object_schema {
                Value::Object(map)
            } else {
                json!({
                    "type": "object",
                    "properties": {"input": Value::Object(map)},
                    "required": ["input"],
                })
            }
        }
        other => json!({
            "type": "object",
            "properties": {"input": other},
            "required": ["input"],
        }),
    };

    match jsonschema::validator_for(&parameters) {
        Ok(_) => Some(parameters),
        Err(e) => {
            tracing::warn!("parameter schema failed validation: {e}");
            None
        }
    }
}

/// Coerces string-typed argument values to the parameter types the schema
/// declares. XML extraction in particular hands everything over as strings.
fn coerce_arguments(schema: &Value, arguments: Value) -> Value {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return arguments;
    };
    let Value::Object(args) = arguments else {
        return arguments;
    };

    let mut coerced = Map::with_capacity(args.len());
    for (key, value) in args {
        let declared = properties
            .get(&key)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str);
        let value = match (declared, &value) {
            (Some("integer"), Value::String(raw)) => raw
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .unwrap_or(value),
            (Some("number"), Value::String(raw)) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or(value),
            (Some("boolean"), Value::String(raw)) => raw
                .trim()
                .parse::<bool>()
                .map(Value::Bool)
                .unwrap_or(value),
            (Some("object") | Some("array"), Value::String(raw)) => {
                serde_json::from_str(raw).unwrap_or(value)
            }
            _ => value,
        };
        coerced.insert(key, value);
    }
    Value::Object(coerced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct EchoTool {
        name: String,
    }

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn get_name(&self) -> String {
            self.name.clone()
        }
        fn get_description(&self) -> String {
            "echoes its arguments".to_string()
        }
        fn get_parameters(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "count": {"type": "integer"},
                    "loud": {"type": "boolean"}
                }
            })
        }
        async fn execute(
            &self,
            call: ToolCall,
            _context: Arc<ToolContext>,
        ) -> Result<Value, AgentError> {
            Ok(call.arguments)
        }
    }

    #[derive(Debug)]
    struct FailingTool;

    #[async_trait::async_trait]
    impl Tool for FailingTool {
        fn get_name(&self) -> String {
            "broken".to_string()
        }
        fn get_description(&self) -> String {
            String::new()
        }
        fn get_parameters(&self) -> Value {
            Value::Null
        }
        async fn execute(
            &self,
            _call: ToolCall,
            _context: Arc<ToolContext>,
        ) -> Result<Value, AgentError> {
            Err(AgentError::ToolExecution("boom".to_string()))
        }
    }

    fn context() -> Arc<ToolContext> {
        Arc::new(ToolContext::new(
            uuid::Uuid::new_v4(),
            uuid::Uuid::new_v4(),
        ))
    }

    fn echo(name: &str) -> Arc<dyn Tool> {
        Arc::new(EchoTool {
            name: name.to_string(),
        })
    }

    #[test]
    fn rejects_duplicates_and_bad_names() {
        let mut registry = ToolRegistry::new();
        registry.register(echo("alpha")).unwrap();
        assert!(matches!(
            registry.register(echo("alpha")),
            Err(AgentError::Validation(_))
        ));
        assert!(matches!(
            registry.register(echo("has spaces")),
            Err(AgentError::Validation(_))
        ));
        assert!(matches!(
            registry.register(echo(&"x".repeat(65))),
            Err(AgentError::Validation(_))
        ));
    }

    #[test]
    fn exports_one_schema_per_registered_tool() {
        let mut registry = ToolRegistry::new();
        for name in ["alpha", "beta", "gamma"] {
            registry.register(echo(name)).unwrap();
        }
        let schemas = registry.openai_schemas();
        assert_eq!(schemas.len(), 3);
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
        for schema in &schemas {
            assert!(TOOL_NAME_RE.is_match(&schema.name));
        }
    }

    #[test]
    fn repairs_null_and_bare_schemas() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FailingTool)).unwrap();
        let schemas = registry.openai_schemas();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].parameters["type"], "object");
        assert_eq!(schemas[0].description, "No description provided");
    }

    #[tokio::test]
    async fn unknown_tool_is_a_failed_outcome() {
        let registry = ToolRegistry::new();
        let call = ToolCall::native("c1", "nope", json!({}));
        let outcome = registry.invoke(&call, context()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.output, json!("tool not found"));
    }

    #[tokio::test]
    async fn tool_errors_become_failed_outcomes() {
        let registry = ToolRegistry::with_tools(vec![Arc::new(FailingTool)]).unwrap();
        let call = ToolCall::native("c1", "broken", json!({}));
        let outcome = registry.invoke(&call, context()).await;
        assert!(!outcome.success);
        assert!(outcome.output_text().contains("boom"));
    }

    #[tokio::test]
    async fn arguments_are_coerced_to_declared_types() {
        let registry = ToolRegistry::with_tools(vec![echo("echo")]).unwrap();
        let call = ToolCall::native(
            "c1",
            "echo",
            json!({"text": "hi", "count": "3", "loud": "true"}),
        );
        let outcome = registry.invoke(&call, context()).await;
        assert!(outcome.success);
        assert_eq!(outcome.output, json!({"text": "hi", "count": 3, "loud": true}));
    }
}
