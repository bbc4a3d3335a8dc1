//! Circle task domain model.
//!
//! A task moves through claim → execute → review inside a circle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AgentId, TaskId};

/// Status of a circle task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, no agent yet.
    Pending,
    /// Routed to an agent, not yet claimed.
    Assigned,
    /// Claimed and being worked on.
    InProgress,
    /// Submitted, awaiting a review decision.
    InReview,
    /// Approved or completed without review.
    Completed,
    /// Rejected, aborted, or cancelled.
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "in_progress" => Some(Self::InProgress),
            "in_review" | "review" => Some(Self::InReview),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal statuses are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses that count toward an agent's workload.
    pub fn counts_toward_workload(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress | Self::InReview)
    }

    /// Valid transitions from this status. The only backward edge is
    /// `in_review → in_progress` on a changes-requested review.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Assigned, Self::InProgress, Self::Failed],
            Self::Assigned => &[Self::InProgress, Self::Failed],
            Self::InProgress => &[Self::InReview, Self::Completed, Self::Failed],
            Self::InReview => &[Self::Completed, Self::InProgress, Self::Failed],
            Self::Completed => &[],
            Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, next: Self) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A work product attached to a task submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path or URI of the artifact.
    pub uri: String,
    /// Artifact kind matched against reviewer `can_review` sets,
    /// e.g. "code", "architecture", "document".
    pub kind: String,
}

impl Artifact {
    pub fn new(uri: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { uri: uri.into(), kind: kind.into() }
    }

    /// Code artifact, the common case.
    pub fn code(uri: impl Into<String>) -> Self {
        Self::new(uri, "code")
    }
}

/// Decision returned by a reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    ChangesRequested,
    Rejected,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Rejected => "rejected",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "approved" => Some(Self::Approved),
            "changes_requested" => Some(Self::ChangesRequested),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One review verdict recorded against a task iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Review {
    pub reviewer_id: AgentId,
    pub decision: ReviewDecision,
    /// Optional quality score, 0–100.
    pub score: Option<u8>,
    pub feedback: Option<String>,
    /// Concrete change requests accompanying a changes-requested verdict.
    pub changes: Vec<String>,
    /// Task iteration this review applied to.
    pub iteration: u32,
    pub at: DateTime<Utc>,
}

/// A unit of work owned by a circle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircleTask {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    pub required_competencies: Vec<String>,
    /// 1 (lowest) to 5 (highest).
    pub priority: u8,
    pub assigned_agent_id: Option<AgentId>,
    pub reviewer_id: Option<AgentId>,
    pub status: TaskStatus,
    /// Starts at 1; incremented on each changes-requested review.
    pub iteration: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<Artifact>,
    pub result: Option<String>,
    pub review_history: Vec<Review>,
    /// Revision notes accumulated from changes-requested reviews.
    pub revision_notes: Vec<String>,
}

impl CircleTask {
    pub fn new(
        id: TaskId,
        title: impl Into<String>,
        description: impl Into<String>,
        required_competencies: Vec<String>,
        priority: u8,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: description.into(),
            required_competencies,
            priority: priority.clamp(1, 5),
            assigned_agent_id: None,
            reviewer_id: None,
            status: TaskStatus::Pending,
            iteration: 1,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            artifacts: Vec::new(),
            result: None,
            review_history: Vec::new(),
            revision_notes: Vec::new(),
        }
    }

    /// Distinct artifact kinds on this task.
    pub fn artifact_kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = Vec::new();
        for artifact in &self.artifacts {
            if !kinds.contains(&artifact.kind) {
                kinds.push(artifact.kind.clone());
            }
        }
        kinds
    }
}
