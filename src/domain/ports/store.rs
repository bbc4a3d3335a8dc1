//! Store boundary ports.
//!
//! The store is the source of truth for background tasks, steps,
//! scheduled actions, and runs. In-memory caches re-hydrate from these
//! repositories and must honor durable state changes observed at loop
//! boundaries.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::errors::CoreResult;
use crate::domain::models::{
    ActionRunStatus, BackgroundTask, BackgroundTaskStatus, ScheduledAction, ScheduledActionRun,
    ScheduledActionStatus, TaskStep,
};

/// Repository for background task persistence.
#[async_trait]
pub trait BackgroundTaskRepository: Send + Sync {
    async fn create(&self, task: &BackgroundTask) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<BackgroundTask>>;

    /// Update every field except `status`. Status moves only through
    /// [`compare_and_set_status`](Self::compare_and_set_status), so a
    /// stale snapshot can never overwrite a concurrent pause/cancel.
    async fn update(&self, task: &BackgroundTask) -> CoreResult<()>;

    async fn delete(&self, id: Uuid) -> CoreResult<()>;

    /// Atomic status transition. Returns `false` when the stored status
    /// no longer matches `expected` (a concurrent writer won the race).
    async fn compare_and_set_status(
        &self,
        id: Uuid,
        expected: BackgroundTaskStatus,
        next: BackgroundTaskStatus,
    ) -> CoreResult<bool>;

    async fn list_by_status(&self, status: BackgroundTaskStatus) -> CoreResult<Vec<BackgroundTask>>;

    /// Tasks durably marked `running`, used by crash recovery.
    async fn list_running(&self) -> CoreResult<Vec<BackgroundTask>>;
}

/// Repository for task step records.
#[async_trait]
pub trait TaskStepRepository: Send + Sync {
    async fn create(&self, step: &TaskStep) -> CoreResult<()>;

    /// Steps of a task ordered by step number.
    async fn list_for_task(&self, task_id: Uuid) -> CoreResult<Vec<TaskStep>>;
}

/// Repository for scheduled action definitions.
#[async_trait]
pub trait ScheduledActionRepository: Send + Sync {
    /// Insert or replace by id.
    async fn upsert(&self, action: &ScheduledAction) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<ScheduledAction>>;

    async fn get_by_name(&self, name: &str) -> CoreResult<Option<ScheduledAction>>;

    async fn delete(&self, id: Uuid) -> CoreResult<()>;

    async fn list(&self, status: Option<ScheduledActionStatus>) -> CoreResult<Vec<ScheduledAction>>;

    /// Actions the clock loop should consider on each tick.
    async fn list_active(&self) -> CoreResult<Vec<ScheduledAction>>;
}

/// Repository for scheduled action run logs.
#[async_trait]
pub trait ActionRunRepository: Send + Sync {
    async fn create(&self, run: &ScheduledActionRun) -> CoreResult<()>;

    async fn update(&self, run: &ScheduledActionRun) -> CoreResult<()>;

    async fn get(&self, id: Uuid) -> CoreResult<Option<ScheduledActionRun>>;

    async fn list_for_action(&self, action_id: Uuid) -> CoreResult<Vec<ScheduledActionRun>>;

    async fn count_for_action(&self, action_id: Uuid) -> CoreResult<u64>;

    async fn list_by_status(&self, status: ActionRunStatus) -> CoreResult<Vec<ScheduledActionRun>>;
}
