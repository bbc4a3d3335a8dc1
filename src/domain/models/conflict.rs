//! Conflict domain model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::AgentId;

/// Kind of conflict the facilitator can detect or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Two agents touched the same resource.
    FileCollision,
    /// A task already in progress was routed again.
    TaskOverlap,
    /// Two reviewers disagreed on the same submission.
    ConflictingReviews,
    /// Explicitly reported circular wait.
    Deadlock,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FileCollision => "file_collision",
            Self::TaskOverlap => "task_overlap",
            Self::ConflictingReviews => "conflicting_reviews",
            Self::Deadlock => "deadlock",
        }
    }
}

/// A detected or reported conflict between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub agent_ids: Vec<AgentId>,
    /// The contended resource, when one exists (a file path, a task id).
    pub resource: Option<String>,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

impl Conflict {
    pub fn new(kind: ConflictKind, agent_ids: Vec<AgentId>, resource: Option<String>) -> Self {
        Self {
            kind,
            agent_ids,
            resource,
            detected_at: Utc::now(),
            resolved: false,
        }
    }
}
