use std::sync::Arc;

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use strand_types::{
    AgentError, SandboxFs, Tool, ToolCall, ToolContext, XmlBinding, XmlField, XmlValueType,
};

/// The built-in tool set: the three terminating tools plus sandbox file and
/// command tools when a sandbox is attached.
pub fn get_builtin_tools(with_sandbox_tools: bool) -> Vec<Arc<dyn Tool>> {
    let mut tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(AskTool),
        Arc::new(CompleteTool),
        Arc::new(BrowserTakeoverTool),
    ];
    if with_sandbox_tools {
        tools.push(Arc::new(ReadFileTool));
        tools.push(Arc::new(CreateFileTool));
        tools.push(Arc::new(ExecuteCommandTool));
    }
    tools
}

fn sandbox_of(context: &ToolContext) -> Result<Arc<dyn SandboxFs>, AgentError> {
    context
        .sandbox
        .clone()
        .ok_or_else(|| AgentError::ToolExecution("no sandbox attached to this run".to_string()))
}

fn string_arg(call: &ToolCall, key: &str) -> Option<String> {
    call.arguments
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Pauses the run to ask the user a question.
#[derive(Debug)]
pub struct AskTool;

#[async_trait::async_trait]
impl Tool for AskTool {
    fn get_name(&self) -> String {
        "ask".to_string()
    }

    fn get_description(&self) -> String {
        "Ask the user a question and wait for their input before continuing".to_string()
    }

    fn get_parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The question to put to the user"
                }
            },
            "required": ["text"]
        })
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        Some(
            XmlBinding::new("ask")
                .with_field(XmlField::content("text"))
                .with_example("<ask>Which environment should I deploy to?</ask>"),
        )
    }

    fn is_terminating(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        call: ToolCall,
        _context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        let text = string_arg(&call, "text").unwrap_or_default();
        Ok(json!({ "question": text }))
    }
}

/// Signals that the task is complete.
#[derive(Debug)]
pub struct CompleteTool;

#[async_trait::async_trait]
impl Tool for CompleteTool {
    fn get_name(&self) -> String {
        "complete".to_string()
    }

    fn get_description(&self) -> String {
        "Indicate that the task is complete and provide the final result to the user".to_string()
    }

    fn get_parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "text": {
                    "type": "string",
                    "description": "The final result or answer to provide to the user"
                }
            }
        })
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        Some(
            XmlBinding::new("complete")
                .with_field(XmlField::content("text"))
                .with_example("<complete>All files have been migrated.</complete>"),
        )
    }

    fn is_terminating(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        call: ToolCall,
        _context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        let text = string_arg(&call, "text").unwrap_or_default();
        Ok(json!({ "result": text }))
    }
}

/// Hands the browser session over to the user.
#[derive(Debug)]
pub struct BrowserTakeoverTool;

#[async_trait::async_trait]
impl Tool for BrowserTakeoverTool {
    fn get_name(&self) -> String {
        "web-browser-takeover".to_string()
    }

    fn get_description(&self) -> String {
        "Request that the user take over the browser session, e.g. to solve a captcha or log in"
            .to_string()
    }

    fn get_parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "reason": {
                    "type": "string",
                    "description": "Why the user needs to take over"
                }
            },
            "required": ["reason"]
        })
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        Some(
            XmlBinding::new("web-browser-takeover")
                .with_field(XmlField::content("reason"))
                .with_example(
                    "<web-browser-takeover>The login page shows a captcha.</web-browser-takeover>",
                ),
        )
    }

    fn is_terminating(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        call: ToolCall,
        _context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        let reason = string_arg(&call, "reason").unwrap_or_default();
        Ok(json!({ "reason": reason }))
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadFileArgs {
    /// Path of the file to read, relative to the sandbox root.
    path: String,
}

#[derive(Debug)]
pub struct ReadFileTool;

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn get_name(&self) -> String {
        "read-file".to_string()
    }

    fn get_description(&self) -> String {
        "Read a file from the project sandbox".to_string()
    }

    fn get_parameters(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ReadFileArgs)).unwrap_or_default()
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        Some(
            XmlBinding::new("read-file")
                .with_field(XmlField::attribute("path", "path"))
                .with_example(r#"<read-file path="notes/todo.md"/>"#),
        )
    }

    async fn execute(
        &self,
        call: ToolCall,
        context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        let args: ReadFileArgs = serde_json::from_value(call.arguments)
            .map_err(|e| AgentError::ToolExecution(format!("invalid arguments: {e}")))?;
        let sandbox = sandbox_of(&context)?;
        match sandbox.read_file(&args.path).await? {
            Some(contents) => Ok(Value::String(contents)),
            None => Err(AgentError::ToolExecution(format!(
                "file not found: {}",
                args.path
            ))),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CreateFileArgs {
    /// Path of the file to write, relative to the sandbox root.
    path: String,
    /// Full contents of the file.
    contents: String,
}

#[derive(Debug)]
pub struct CreateFileTool;

#[async_trait::async_trait]
impl Tool for CreateFileTool {
    fn get_name(&self) -> String {
        "create-file".to_string()
    }

    fn get_description(&self) -> String {
        "Create or overwrite a file in the project sandbox".to_string()
    }

    fn get_parameters(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(CreateFileArgs)).unwrap_or_default()
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        Some(
            XmlBinding::new("create-file")
                .with_field(XmlField::attribute("path", "path"))
                .with_field(XmlField::content("contents"))
                .with_example("<create-file path=\"src/notes.txt\">file body here</create-file>"),
        )
    }

    async fn execute(
        &self,
        call: ToolCall,
        context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        let args: CreateFileArgs = serde_json::from_value(call.arguments)
            .map_err(|e| AgentError::ToolExecution(format!("invalid arguments: {e}")))?;
        let sandbox = sandbox_of(&context)?;
        sandbox.write_file(&args.path, &args.contents).await?;
        Ok(json!({ "path": args.path, "bytes": args.contents.len() }))
    }
}

#[derive(Debug)]
pub struct ExecuteCommandTool;

#[async_trait::async_trait]
impl Tool for ExecuteCommandTool {
    fn get_name(&self) -> String {
        "execute-command".to_string()
    }

    fn get_description(&self) -> String {
        "Run a shell command inside the project sandbox and return its output".to_string()
    }

    fn get_parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command line to execute"
                }
            },
            "required": ["command"]
        })
    }

    fn xml_binding(&self) -> Option<XmlBinding> {
        Some(
            XmlBinding::new("execute-command")
                .with_field(
                    XmlField::content("command").with_value_type(XmlValueType::String),
                )
                .with_example("<execute-command>ls -la</execute-command>"),
        )
    }

    async fn execute(
        &self,
        call: ToolCall,
        context: Arc<ToolContext>,
    ) -> Result<Value, AgentError> {
        let command = string_arg(&call, "command")
            .ok_or_else(|| AgentError::ToolExecution("missing command argument".to_string()))?;
        let sandbox = sandbox_of(&context)?;
        let output = sandbox.run_command(&command).await?;
        Ok(json!({
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
    }
}
