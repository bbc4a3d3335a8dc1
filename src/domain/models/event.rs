//! Event domain model.
//!
//! Events are immutable records published on the in-process bus. Each
//! carries a kind, an opaque structured payload, and derived topic tags
//! used by topic-filtered subscriptions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::ids::AgentId;

/// Kind of an event on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Circle lifecycle
    CircleStarted,
    CircleStopped,
    AgentJoined,
    AgentLeft,

    // Task lifecycle
    TaskCreated,
    TaskAssigned,
    TaskPendingNoAgent,
    TaskClaimed,
    TaskSubmitted,
    TaskCompleted,
    TaskFailed,

    // Review flow
    ReviewRequested,
    ReviewCompleted,
    Escalation,
    Conflict,

    // Messaging
    Message,
    Mention,
    ConversationStarted,
    ConversationCompleted,

    // Background execution
    TaskStep,
    BackgroundTaskStarted,
    BackgroundTaskPaused,
    BackgroundTaskResumed,
    BackgroundTaskCompleted,
    BackgroundTaskFailed,
    BackgroundTaskTimeout,
    BackgroundTaskCancelled,
    CheckpointWritten,

    // Scheduling
    ScheduleRegistered,
    ScheduleFired,
    ScheduleSkipped,
    ScheduleCompleted,
    ScheduleFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircleStarted => "circle_started",
            Self::CircleStopped => "circle_stopped",
            Self::AgentJoined => "agent_joined",
            Self::AgentLeft => "agent_left",
            Self::TaskCreated => "task_created",
            Self::TaskAssigned => "task_assigned",
            Self::TaskPendingNoAgent => "task_pending_no_agent",
            Self::TaskClaimed => "task_claimed",
            Self::TaskSubmitted => "task_submitted",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::ReviewRequested => "review_requested",
            Self::ReviewCompleted => "review_completed",
            Self::Escalation => "escalation",
            Self::Conflict => "conflict",
            Self::Message => "message",
            Self::Mention => "mention",
            Self::ConversationStarted => "conversation_started",
            Self::ConversationCompleted => "conversation_completed",
            Self::TaskStep => "task_step",
            Self::BackgroundTaskStarted => "background_task_started",
            Self::BackgroundTaskPaused => "background_task_paused",
            Self::BackgroundTaskResumed => "background_task_resumed",
            Self::BackgroundTaskCompleted => "background_task_completed",
            Self::BackgroundTaskFailed => "background_task_failed",
            Self::BackgroundTaskTimeout => "background_task_timeout",
            Self::BackgroundTaskCancelled => "background_task_cancelled",
            Self::CheckpointWritten => "checkpoint_written",
            Self::ScheduleRegistered => "schedule_registered",
            Self::ScheduleFired => "schedule_fired",
            Self::ScheduleSkipped => "schedule_skipped",
            Self::ScheduleCompleted => "schedule_completed",
            Self::ScheduleFailed => "schedule_failed",
        }
    }

    /// Base topic this kind publishes under.
    pub fn base_topic(&self) -> &'static str {
        match self {
            Self::CircleStarted | Self::CircleStopped => "circles",
            Self::AgentJoined | Self::AgentLeft => "agents",
            Self::TaskCreated
            | Self::TaskAssigned
            | Self::TaskPendingNoAgent
            | Self::TaskClaimed
            | Self::TaskSubmitted
            | Self::TaskCompleted
            | Self::TaskFailed
            | Self::ReviewRequested
            | Self::ReviewCompleted
            | Self::Escalation
            | Self::Conflict => "tasks",
            Self::Message
            | Self::Mention
            | Self::ConversationStarted
            | Self::ConversationCompleted => "conversations",
            Self::TaskStep
            | Self::BackgroundTaskStarted
            | Self::BackgroundTaskPaused
            | Self::BackgroundTaskResumed
            | Self::BackgroundTaskCompleted
            | Self::BackgroundTaskFailed
            | Self::BackgroundTaskTimeout
            | Self::BackgroundTaskCancelled
            | Self::CheckpointWritten => "background",
            Self::ScheduleRegistered
            | Self::ScheduleFired
            | Self::ScheduleSkipped
            | Self::ScheduleCompleted
            | Self::ScheduleFailed => "scheduler",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record on the internal bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    /// Opaque structured payload. Keys like `circle`, `task_id`, or
    /// `conversation_id` also feed topic derivation.
    pub payload: Value,
    pub source_agent_id: Option<AgentId>,
    pub timestamp: DateTime<Utc>,
    /// Lowercase hierarchical topic tags, e.g. `agents`, `agents:7`,
    /// `circles:research`.
    pub topics: Vec<String>,
}

impl Event {
    /// Build an event, deriving topics from the kind, source agent, and
    /// well-known payload keys.
    pub fn new(kind: EventKind, payload: Value, source_agent_id: Option<AgentId>) -> Self {
        let topics = derive_topics(kind, &payload, source_agent_id);
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            source_agent_id,
            timestamp: Utc::now(),
            topics,
        }
    }

    /// Payload field as a string, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Payload field as an unsigned integer, if present.
    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

fn derive_topics(kind: EventKind, payload: &Value, source: Option<AgentId>) -> Vec<String> {
    let mut topics = vec![kind.base_topic().to_string()];

    if let Some(agent) = source {
        push_unique(&mut topics, "agents".to_string());
        push_unique(&mut topics, format!("agents:{agent}"));
    }
    if let Some(circle) = payload.get("circle").and_then(Value::as_str) {
        push_unique(&mut topics, "circles".to_string());
        push_unique(&mut topics, format!("circles:{}", circle.to_lowercase()));
    }
    if let Some(task) = payload.get("task_id") {
        if let Some(id) = task.as_u64() {
            push_unique(&mut topics, format!("tasks:{id}"));
        } else if let Some(id) = task.as_str() {
            push_unique(&mut topics, format!("tasks:{id}"));
        }
    }
    if let Some(conv) = payload.get("conversation_id").and_then(Value::as_str) {
        push_unique(&mut topics, format!("conversations:{conv}"));
    }

    topics
}

fn push_unique(topics: &mut Vec<String>, topic: String) {
    if !topics.contains(&topic) {
        topics.push(topic);
    }
}

/// Whether a subscriber topic pattern matches an event topic.
///
/// `T` matches `T` exactly; `T:*` matches any topic one level below `T`
/// (prefix match up to the `:` separator).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix(":*") {
        topic
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':'))
    } else {
        pattern == topic
    }
}
