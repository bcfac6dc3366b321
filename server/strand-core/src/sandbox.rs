use std::path::{Component, Path, PathBuf};

use strand_types::{AgentError, CommandOutput, SandboxFs};

/// Sandbox backed by a local directory. Paths are confined to the root; the
/// real deployment swaps this for the remote sandbox service client.
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    root: PathBuf,
}

impl LocalSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, AgentError> {
        let relative = Path::new(path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(AgentError::Validation(format!(
                "path escapes the sandbox: {path}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl SandboxFs for LocalSandbox {
    async fn read_file(&self, path: &str) -> Result<Option<String>, AgentError> {
        let resolved = self.resolve(path)?;
        match tokio::fs::read_to_string(&resolved).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentError::Storage(format!(
                "failed to read {path}: {e}"
            ))),
        }
    }

    async fn write_file(&self, path: &str, contents: &str) -> Result<(), AgentError> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Storage(format!("failed to create {path}: {e}")))?;
        }
        tokio::fs::write(&resolved, contents)
            .await
            .map_err(|e| AgentError::Storage(format!("failed to write {path}: {e}")))
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput, AgentError> {
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| AgentError::ToolExecution(format!("failed to spawn command: {e}")))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
