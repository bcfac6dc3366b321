use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run status lattice: pending -> running -> {completed | stopped | failed}.
/// Terminal states are reached exactly once; no resurrection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed
        )
    }

    fn rank(&self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed => 2,
        }
    }

    /// Strictly monotonic: a run may skip `running` (e.g. failing validation
    /// before the lease is claimed) but can never move sideways or back.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl std::str::FromStr for RunStatus {
    type Err = crate::errors::AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "stopped" => Ok(RunStatus::Stopped),
            "failed" => Ok(RunStatus::Failed),
            other => Err(crate::errors::AgentError::Validation(format!(
                "unknown run status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end execution of the agent loop on a single thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRun {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub model_name: String,
    pub user_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAgentRun {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub model_name: String,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    #[default]
    Medium,
    High,
}

/// Work-queue envelope, deserialized exactly as it appears on the wire.
/// Unknown fields are ignored so producers can evolve independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSubmission {
    pub agent_run_id: Uuid,
    pub thread_id: Uuid,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub model_name: String,
    #[serde(default)]
    pub enable_thinking: bool,
    #[serde(default)]
    pub reasoning_effort: ReasoningEffort,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub enable_context_manager: bool,
    #[serde(default)]
    pub user_id: Option<Uuid>,
}
