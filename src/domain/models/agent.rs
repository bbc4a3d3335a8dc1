//! Agent domain model.
//!
//! An agent is an autonomous participant in a circle: it carries
//! competencies, review capabilities, and optional behavior callbacks
//! that the orchestration engine invokes at lifecycle points.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, TaskId};
use super::task::{CircleTask, ReviewDecision};

/// Decides whether the agent accepts an offered task. Defaults to accept.
pub type AcceptTaskFn = Arc<dyn Fn(CircleTask) -> BoxFuture<'static, bool> + Send + Sync>;

/// Executes a claimed task, producing a result summary or an error.
pub type ExecuteTaskFn =
    Arc<dyn Fn(CircleTask) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Produces the agent's reply to a conversation prompt. `None` declines
/// the turn.
pub type ProcessMessageFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Option<String>> + Send + Sync>;

/// Reviews submitted work, producing a decision and optional feedback.
pub type ReviewWorkFn =
    Arc<dyn Fn(CircleTask) -> BoxFuture<'static, (ReviewDecision, Option<String>)> + Send + Sync>;

/// Optional behavior callbacks attached to an agent.
#[derive(Clone, Default)]
pub struct AgentCallbacks {
    pub accept_task: Option<AcceptTaskFn>,
    pub execute_task: Option<ExecuteTaskFn>,
    pub process_message: Option<ProcessMessageFn>,
    pub review_work: Option<ReviewWorkFn>,
}

impl std::fmt::Debug for AgentCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCallbacks")
            .field("accept_task", &self.accept_task.is_some())
            .field("execute_task", &self.execute_task.is_some())
            .field("process_message", &self.process_message.is_some())
            .field("review_work", &self.review_work.is_some())
            .finish()
    }
}

/// An agent registered in a circle.
///
/// Owned exclusively by the circle it belongs to; external code refers
/// to agents by [`AgentId`].
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub id: AgentId,
    pub name: String,
    pub provider: String,
    pub model: String,
    /// Ordered competency tags, free-form strings.
    pub competencies: Vec<String>,
    /// Artifact kinds this agent can review.
    pub can_review: Vec<String>,
    /// Optional persona included in conversation prompts.
    pub persona: Option<String>,
    pub is_active: bool,
    /// The at-most-one task currently held by this agent.
    pub current_task_id: Option<TaskId>,
    pub callbacks: AgentCallbacks,
}

impl AgentHandle {
    pub fn new(id: AgentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            provider: String::new(),
            model: String::new(),
            competencies: Vec::new(),
            can_review: Vec::new(),
            persona: None,
            is_active: true,
            current_task_id: None,
            callbacks: AgentCallbacks::default(),
        }
    }

    // Builder methods
    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = provider.into();
        self.model = model.into();
        self
    }

    pub fn with_competencies<I, S>(mut self, competencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.competencies = competencies.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_can_review<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.can_review = kinds.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_callbacks(mut self, callbacks: AgentCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn has_competencies(&self, required: &[String]) -> bool {
        required.iter().all(|c| self.competencies.contains(c))
    }

    pub fn can_review_kind(&self, kind: &str) -> bool {
        self.can_review.iter().any(|k| k == kind)
    }
}

/// Per-agent workload and quality counters maintained by the facilitator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub reviews_done: u64,
    /// Count of this agent's tasks in assigned/in-progress/in-review.
    pub current_workload: u32,
    pub average_completion_ms: f64,
    pub max_workload: u32,
}

impl AgentMetrics {
    pub const DEFAULT_MAX_WORKLOAD: u32 = 5;

    pub fn new() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            reviews_done: 0,
            current_workload: 0,
            average_completion_ms: 0.0,
            max_workload: Self::DEFAULT_MAX_WORKLOAD,
        }
    }

    /// `1 − min(1, workload / max_workload)`, in `[0, 1]`.
    pub fn availability_score(&self) -> f64 {
        let ratio = f64::from(self.current_workload) / f64::from(self.max_workload.max(1));
        1.0 - ratio.min(1.0)
    }

    /// `completed / max(1, completed + failed)`.
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        self.tasks_completed as f64 / (total.max(1)) as f64
    }

    pub fn record_completion(&mut self, duration_ms: u64) {
        self.current_workload = self.current_workload.saturating_sub(1);
        self.tasks_completed += 1;
        // Running average over completed tasks.
        let n = self.tasks_completed as f64;
        self.average_completion_ms =
            self.average_completion_ms + (duration_ms as f64 - self.average_completion_ms) / n;
    }

    pub fn record_failure(&mut self) {
        self.current_workload = self.current_workload.saturating_sub(1);
        self.tasks_failed += 1;
    }

    pub fn record_assignment(&mut self) {
        self.current_workload += 1;
    }

    pub fn record_review(&mut self) {
        self.reviews_done += 1;
    }
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}
