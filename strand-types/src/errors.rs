#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Transient error: {0}")]
    Transient(String),
    #[error("Tool execution error: {0}")]
    ToolExecution(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("LLM error: {0}")]
    LlmError(String),
    #[error("Parsing error: {0}")]
    Parsing(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    SerdeError(#[from] serde_json::Error),
}

impl AgentError {
    /// Transient errors may be retried by the component that raised them.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentError::Transient(_))
    }

    /// Fatal and configuration errors unwind the run; everything else is
    /// converted to a status frame at the iteration boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AgentError::Fatal(_) | AgentError::InvalidConfiguration(_)
        )
    }

    /// Short text suitable for the `error` column of a failed run.
    pub fn summary(&self) -> String {
        self.to_string()
    }
}
