//! Domain models
//!
//! Pure domain entities with business logic and validation rules.
//! These models are framework-agnostic and contain no infrastructure
//! concerns.

pub mod agent;
pub mod background;
pub mod conflict;
pub mod conversation;
pub mod event;
pub mod ids;
pub mod schedule;
pub mod task;

pub use agent::{
    AcceptTaskFn, AgentCallbacks, AgentHandle, AgentMetrics, ExecuteTaskFn, ProcessMessageFn,
    ReviewWorkFn,
};
pub use background::{BackgroundTask, BackgroundTaskStatus, Checkpoint, StepAction, TaskStep};
pub use conflict::{Conflict, ConflictKind};
pub use conversation::{
    Conversation, ConversationMessage, ConversationResult, ConversationStatus, TurnStrategy,
};
pub use event::{topic_matches, Event, EventKind};
pub use ids::{AgentId, ConversationId, TaskId};
pub use schedule::{
    ActionRunStatus, ScheduleSpec, ScheduledAction, ScheduledActionRun, ScheduledActionStatus,
    TriggerSource,
};
pub use task::{Artifact, CircleTask, Review, ReviewDecision, TaskStatus};
