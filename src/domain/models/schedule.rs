//! Scheduled action domain model.
//!
//! A scheduled action is a cron / interval / one-shot / event trigger
//! that launches a background task with a step and timeout policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ids::AgentId;

/// The scheduling descriptor. Exactly one variant is set, consistent
/// with the action's schedule type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    /// Fire per a 5-field cron expression (min hour dom month dow).
    Cron { expression: String },
    /// Fire every `seconds` (minimum 60).
    Interval { seconds: u64 },
    /// Fire once at a specific time.
    Once { at: DateTime<Utc> },
    /// Fire only when a named event arrives.
    Event { trigger: String },
}

impl ScheduleSpec {
    pub fn schedule_type(&self) -> &'static str {
        match self {
            Self::Cron { .. } => "cron",
            Self::Interval { .. } => "interval",
            Self::Once { .. } => "once",
            Self::Event { .. } => "event",
        }
    }

    /// Human-readable description of the schedule.
    pub fn description(&self) -> String {
        match self {
            Self::Cron { expression } => format!("cron: {expression}"),
            Self::Interval { seconds } => {
                if *seconds >= 3600 {
                    format!("every {} hour(s)", seconds / 3600)
                } else {
                    format!("every {} minute(s)", seconds / 60)
                }
            }
            Self::Once { at } => format!("once at {}", at.format("%Y-%m-%d %H:%M UTC")),
            Self::Event { trigger } => format!("on event: {trigger}"),
        }
    }
}

/// Status of a scheduled action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledActionStatus {
    Active,
    Paused,
    Completed,
    Failed,
}

impl ScheduledActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// What triggered a particular run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduler,
    Manual,
    Event,
    Retry,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduler => "scheduler",
            Self::Manual => "manual",
            Self::Event => "event",
            Self::Retry => "retry",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "scheduler" => Some(Self::Scheduler),
            "manual" => Some(Self::Manual),
            "event" => Some(Self::Event),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

/// A recurring or triggered launcher for background tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledAction {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub circle_id: Option<u64>,
    /// Unique human-readable name.
    pub name: String,
    pub description: Option<String>,
    pub goal: String,
    pub schedule: ScheduleSpec,
    /// Next computed firing time; `None` for event-triggered and
    /// exhausted schedules.
    pub next_run_at: Option<DateTime<Utc>>,

    // -- Run policy --
    pub max_steps: u32,
    pub timeout_seconds: u64,
    pub retry_on_failure: bool,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub allow_concurrent: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub max_executions: Option<u64>,

    // -- Counters --
    pub execution_count: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<String>,
    pub status: ScheduledActionStatus,
    pub tags: Vec<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledAction {
    pub fn new(agent_id: AgentId, name: impl Into<String>, goal: impl Into<String>, schedule: ScheduleSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            circle_id: None,
            name: name.into(),
            description: None,
            goal: goal.into(),
            schedule,
            next_run_at: None,
            max_steps: 50,
            timeout_seconds: 3600,
            retry_on_failure: true,
            max_retries: 3,
            retry_delay_seconds: 300,
            allow_concurrent: false,
            start_date: None,
            end_date: None,
            max_executions: None,
            execution_count: 0,
            last_run_at: None,
            last_run_status: None,
            status: ScheduledActionStatus::Active,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    // Builder methods
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_policy(mut self, max_steps: u32, timeout_seconds: u64) -> Self {
        self.max_steps = max_steps;
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay_seconds: u64) -> Self {
        self.retry_on_failure = max_retries > 0;
        self.max_retries = max_retries;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn with_window(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    pub fn with_max_executions(mut self, max: u64) -> Self {
        self.max_executions = Some(max);
        self
    }

    pub fn allow_concurrent(mut self, allow: bool) -> Self {
        self.allow_concurrent = allow;
        self
    }

    /// Whether the execution budget or end date is exhausted at `now`.
    pub fn exhausted(&self, now: DateTime<Utc>) -> bool {
        if self.end_date.is_some_and(|end| now > end) {
            return true;
        }
        self.max_executions
            .is_some_and(|max| self.execution_count >= max)
    }
}

/// Status of one scheduled action run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl ActionRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Log of one firing of a scheduled action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledActionRun {
    pub id: Uuid,
    pub action_id: Uuid,
    /// Background task launched for this run, when the start succeeded.
    pub background_task_id: Option<Uuid>,
    /// 1-based ordinal of this run for its action.
    pub run_number: u64,
    pub triggered_at: DateTime<Utc>,
    pub triggered_by: TriggerSource,
    pub status: ActionRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_summary: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub duration_ms: u64,
    pub steps_executed: u32,
}

impl ScheduledActionRun {
    pub fn new(action_id: Uuid, run_number: u64, triggered_by: TriggerSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_id,
            background_task_id: None,
            run_number,
            triggered_at: Utc::now(),
            triggered_by,
            status: ActionRunStatus::Running,
            started_at: None,
            completed_at: None,
            result_summary: None,
            error: None,
            retry_count: 0,
            duration_ms: 0,
            steps_executed: 0,
        }
    }
}
