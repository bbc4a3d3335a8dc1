//! Background task domain model.
//!
//! A background task is a step-bounded goal loop executed autonomously
//! by the executor, with durable checkpoints for resume.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ids::AgentId;

/// Status of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundTaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl Default for BackgroundTaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl BackgroundTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "timeout" => Some(Self::Timeout),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout | Self::Cancelled)
    }
}

impl std::fmt::Display for BackgroundTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable snapshot sufficient to resume a goal loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Step counter at checkpoint time.
    pub step: u32,
    /// Accumulated context carried between steps.
    pub context: Value,
    pub at: DateTime<Utc>,
}

/// A step-bounded autonomous goal loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundTask {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub goal: String,
    /// Structured context passed to the agent on each step.
    pub goal_context: Value,
    pub current_step: u32,
    pub max_steps: u32,
    /// Write a checkpoint every this many steps.
    pub checkpoint_interval: u32,
    /// Wall-clock deadline measured from `started_at`.
    pub timeout_seconds: u64,
    pub status: BackgroundTaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub checkpoint: Option<Checkpoint>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
}

impl BackgroundTask {
    pub const DEFAULT_MAX_STEPS: u32 = 50;
    pub const DEFAULT_CHECKPOINT_INTERVAL: u32 = 5;
    pub const DEFAULT_TIMEOUT_SECONDS: u64 = 3600;

    pub fn new(agent_id: AgentId, goal: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            goal: goal.into(),
            goal_context: Value::Null,
            current_step: 0,
            max_steps: Self::DEFAULT_MAX_STEPS,
            checkpoint_interval: Self::DEFAULT_CHECKPOINT_INTERVAL,
            timeout_seconds: Self::DEFAULT_TIMEOUT_SECONDS,
            status: BackgroundTaskStatus::Pending,
            result: None,
            error: None,
            checkpoint: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_checkpoint_at: None,
        }
    }

    // Builder methods
    pub fn with_context(mut self, context: Value) -> Self {
        self.goal_context = context;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Whether the wall-clock deadline has passed.
    pub fn deadline_exceeded(&self, now: DateTime<Utc>) -> bool {
        self.started_at.is_some_and(|started| {
            now.signed_duration_since(started)
                >= chrono::Duration::seconds(self.timeout_seconds as i64)
        })
    }
}

/// What a driver asks the runner to do next.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Dispatch a tool through the skill registry.
    ToolCall { tool: String, input: Value },
    /// Emit a message event, then continue looping.
    Emit { message: String },
    /// Terminal result; the task completes.
    Complete { result: String },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ToolCall { .. } => "tool_call",
            Self::Emit { .. } => "message",
            Self::Complete { .. } => "complete",
        }
    }
}

/// Record of one runner iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: Uuid,
    pub task_id: Uuid,
    /// 1-based step number.
    pub step_number: u32,
    /// Action kind: `tool_call`, `message`, or `complete`.
    pub action: String,
    pub tool: Option<String>,
    pub input: Value,
    pub output: Value,
    pub success: bool,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub duration_ms: u64,
    /// Link to the step whose output this step consumed.
    pub prior_step_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl TaskStep {
    pub fn new(task_id: Uuid, step_number: u32, action: &StepAction) -> Self {
        let (tool, input) = match action {
            StepAction::ToolCall { tool, input } => (Some(tool.clone()), input.clone()),
            StepAction::Emit { message } => (None, Value::String(message.clone())),
            StepAction::Complete { result } => (None, Value::String(result.clone())),
        };
        Self {
            id: Uuid::new_v4(),
            task_id,
            step_number,
            action: action.kind().to_string(),
            tool,
            input,
            output: Value::Null,
            success: true,
            tokens_in: 0,
            tokens_out: 0,
            duration_ms: 0,
            prior_step_id: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_requires_start() {
        let task = BackgroundTask::new(AgentId(1), "goal").with_timeout(1);
        assert!(!task.deadline_exceeded(Utc::now()));
    }

    #[test]
    fn deadline_after_timeout() {
        let mut task = BackgroundTask::new(AgentId(1), "goal").with_timeout(60);
        task.started_at = Some(Utc::now() - chrono::Duration::seconds(120));
        assert!(task.deadline_exceeded(Utc::now()));
    }

    #[test]
    fn terminal_statuses() {
        assert!(BackgroundTaskStatus::Timeout.is_terminal());
        assert!(BackgroundTaskStatus::Cancelled.is_terminal());
        assert!(!BackgroundTaskStatus::Paused.is_terminal());
    }
}
