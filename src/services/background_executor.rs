//! Background task executor.
//!
//! Runs step-bounded autonomous goal loops, one runner per task, on a
//! bounded worker pool. Runners observe durable state at each loop
//! boundary, so pause, cancel, and shutdown are cooperative. Crash
//! recovery parks orphaned `running` tasks as `paused` for an explicit
//! resume.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use chrono::Utc;
use serde_json::json;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    AgentId, BackgroundTask, BackgroundTaskStatus, Checkpoint, EventKind, StepAction, TaskStep,
};
use crate::domain::ports::{
    AgentDriver, BackgroundTaskRepository, SkillDispatcher, TaskStepRepository,
};

use super::event_bus::EventBus;

/// Tunables for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker pool size shared by all runners.
    pub max_concurrent: usize,
    /// Cooperative yield between steps.
    pub step_backoff: Duration,
    /// Initial delay of the in-place step retry.
    pub retry_initial_backoff: Duration,
    /// Ceiling of the in-place step retry delay.
    pub retry_max_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            step_backoff: Duration::from_millis(50),
            retry_initial_backoff: Duration::from_millis(200),
            retry_max_backoff: Duration::from_secs(2),
        }
    }
}

struct ExecutorInner {
    tasks: Arc<dyn BackgroundTaskRepository>,
    steps: Arc<dyn TaskStepRepository>,
    skills: Arc<dyn SkillDispatcher>,
    bus: Arc<EventBus>,
    drivers: RwLock<HashMap<AgentId, Arc<dyn AgentDriver>>>,
    runners: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    permits: Arc<Semaphore>,
    draining: AtomicBool,
    config: ExecutorConfig,
}

/// Executes background goal loops with pause/resume/cancel and recovery.
#[derive(Clone)]
pub struct BackgroundExecutor {
    inner: Arc<ExecutorInner>,
}

impl BackgroundExecutor {
    pub fn new(
        tasks: Arc<dyn BackgroundTaskRepository>,
        steps: Arc<dyn TaskStepRepository>,
        skills: Arc<dyn SkillDispatcher>,
        bus: Arc<EventBus>,
        config: ExecutorConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(ExecutorInner {
                tasks,
                steps,
                skills,
                bus,
                drivers: RwLock::new(HashMap::new()),
                runners: Mutex::new(HashMap::new()),
                permits,
                draining: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Register the driver that produces steps for an agent's tasks.
    pub async fn register_driver(&self, agent_id: AgentId, driver: Arc<dyn AgentDriver>) {
        self.inner.drivers.write().await.insert(agent_id, driver);
    }

    /// Persist a task and spawn its goal loop. Fails with `Capacity`
    /// while the executor is draining.
    pub async fn start_task(&self, mut task: BackgroundTask) -> CoreResult<Uuid> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(CoreError::Capacity("executor is draining".to_string()));
        }

        task.status = BackgroundTaskStatus::Pending;
        self.inner.tasks.create(&task).await?;

        if !self
            .inner
            .tasks
            .compare_and_set_status(task.id, BackgroundTaskStatus::Pending, BackgroundTaskStatus::Running)
            .await?
        {
            return Err(CoreError::Conflict(format!(
                "task {} changed state before start",
                task.id
            )));
        }
        task.status = BackgroundTaskStatus::Running;
        task.started_at = Some(Utc::now());
        self.inner.tasks.update(&task).await?;

        self.inner
            .bus
            .emit(
                EventKind::BackgroundTaskStarted,
                json!({ "task_id": task.id.to_string(), "goal": task.goal }),
                Some(task.agent_id),
            )
            .await;

        self.spawn_runner(task.id).await;
        Ok(task.id)
    }

    /// Durably pause a running task; its runner yields at the next
    /// boundary.
    pub async fn pause_task(&self, task_id: Uuid) -> CoreResult<()> {
        let task = self.require(task_id).await?;
        match task.status {
            BackgroundTaskStatus::Running => {}
            // Pause is re-entrant safe.
            BackgroundTaskStatus::Paused => return Ok(()),
            other => {
                return Err(CoreError::InvalidState(format!(
                    "cannot pause task {task_id} from {other}"
                )));
            }
        }
        if !self
            .inner
            .tasks
            .compare_and_set_status(task_id, BackgroundTaskStatus::Running, BackgroundTaskStatus::Paused)
            .await?
        {
            return Err(CoreError::Conflict(format!("task {task_id} lost pause race")));
        }
        self.inner
            .bus
            .emit(
                EventKind::BackgroundTaskPaused,
                json!({ "task_id": task_id.to_string() }),
                Some(task.agent_id),
            )
            .await;
        Ok(())
    }

    /// Resume a paused task from its last checkpoint, spawning a new
    /// runner when none is live.
    pub async fn resume_task(&self, task_id: Uuid) -> CoreResult<()> {
        if self.inner.draining.load(Ordering::SeqCst) {
            return Err(CoreError::Capacity("executor is draining".to_string()));
        }
        let task = self.require(task_id).await?;
        if task.status != BackgroundTaskStatus::Paused {
            return Err(CoreError::InvalidState(format!(
                "cannot resume task {task_id} from {}",
                task.status
            )));
        }
        if !self
            .inner
            .tasks
            .compare_and_set_status(task_id, BackgroundTaskStatus::Paused, BackgroundTaskStatus::Running)
            .await?
        {
            return Err(CoreError::Conflict(format!("task {task_id} lost resume race")));
        }
        self.inner
            .bus
            .emit(
                EventKind::BackgroundTaskResumed,
                json!({
                    "task_id": task_id.to_string(),
                    "current_step": task.current_step,
                }),
                Some(task.agent_id),
            )
            .await;
        self.spawn_runner(task_id).await;
        Ok(())
    }

    /// Durably cancel a task; a live runner terminates cleanly at the
    /// next boundary.
    pub async fn cancel_task(&self, task_id: Uuid, reason: Option<&str>) -> CoreResult<()> {
        let mut task = self.require(task_id).await?;
        if task.status.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "task {task_id} is already {}",
                task.status
            )));
        }
        // One local retry on a lost race, per the conflict policy.
        let mut attempts = 0;
        loop {
            let current = task.status;
            if self
                .inner
                .tasks
                .compare_and_set_status(task_id, current, BackgroundTaskStatus::Cancelled)
                .await?
            {
                break;
            }
            attempts += 1;
            task = self.require(task_id).await?;
            if task.status.is_terminal() {
                return Err(CoreError::InvalidState(format!(
                    "task {task_id} reached {} before cancel",
                    task.status
                )));
            }
            if attempts > 1 {
                return Err(CoreError::Conflict(format!("task {task_id} lost cancel race")));
            }
        }

        task.status = BackgroundTaskStatus::Cancelled;
        task.error = Some(reason.unwrap_or("cancelled").to_string());
        task.completed_at = Some(Utc::now());
        self.inner.tasks.update(&task).await?;
        self.inner
            .bus
            .emit(
                EventKind::BackgroundTaskCancelled,
                json!({
                    "task_id": task_id.to_string(),
                    "reason": task.error,
                }),
                Some(task.agent_id),
            )
            .await;
        Ok(())
    }

    /// Park orphaned `running` tasks (no live runner) as `paused` with a
    /// recovery note. Returns how many were parked.
    pub async fn recover_tasks(&self) -> CoreResult<usize> {
        let running = self.inner.tasks.list_running().await?;
        let mut recovered = 0;
        for mut task in running {
            if self.has_live_runner(task.id).await {
                continue;
            }
            if !self
                .inner
                .tasks
                .compare_and_set_status(task.id, BackgroundTaskStatus::Running, BackgroundTaskStatus::Paused)
                .await?
            {
                continue;
            }
            task.status = BackgroundTaskStatus::Paused;
            task.error = Some("recovered: runner lost, paused for explicit resume".to_string());
            self.inner.tasks.update(&task).await?;
            tracing::info!(task_id = %task.id, "recovered orphaned running task");
            self.inner
                .bus
                .emit(
                    EventKind::BackgroundTaskPaused,
                    json!({ "task_id": task.id.to_string(), "recovered": true }),
                    Some(task.agent_id),
                )
                .await;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Drain: refuse new starts, pause every running task, wait up to
    /// `timeout` for runners to yield, then abort stragglers.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.draining.store(true, Ordering::SeqCst);

        let ids: Vec<Uuid> = self.inner.runners.lock().await.keys().copied().collect();
        for task_id in &ids {
            match self.inner.tasks.get(*task_id).await {
                Ok(Some(task)) if task.status == BackgroundTaskStatus::Running => {
                    if let Err(error) = self.pause_for_shutdown(task).await {
                        tracing::warn!(%task_id, %error, "failed to pause task for shutdown");
                    }
                }
                _ => {}
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            let live = {
                let runners = self.inner.runners.lock().await;
                runners.values().any(|h| !h.is_finished())
            };
            if !live || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut runners = self.inner.runners.lock().await;
        for (task_id, handle) in runners.drain() {
            if !handle.is_finished() {
                tracing::warn!(%task_id, "force-cancelling straggler runner");
                handle.abort();
            }
        }
    }

    pub async fn has_live_runner(&self, task_id: Uuid) -> bool {
        let runners = self.inner.runners.lock().await;
        runners.get(&task_id).is_some_and(|h| !h.is_finished())
    }

    pub async fn task(&self, task_id: Uuid) -> CoreResult<Option<BackgroundTask>> {
        self.inner.tasks.get(task_id).await
    }

    async fn require(&self, task_id: Uuid) -> CoreResult<BackgroundTask> {
        self.inner
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("background task", task_id))
    }

    async fn pause_for_shutdown(&self, mut task: BackgroundTask) -> CoreResult<()> {
        if self
            .inner
            .tasks
            .compare_and_set_status(task.id, BackgroundTaskStatus::Running, BackgroundTaskStatus::Paused)
            .await?
        {
            task.status = BackgroundTaskStatus::Paused;
            task.error = Some("paused: executor shutdown".to_string());
            self.inner.tasks.update(&task).await?;
        }
        Ok(())
    }

    async fn spawn_runner(&self, task_id: Uuid) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(run_loop(inner, task_id));
        let mut runners = self.inner.runners.lock().await;
        runners.retain(|_, h| !h.is_finished());
        runners.insert(task_id, handle);
    }
}

/// The goal loop: one iteration per step, durable state refreshed at
/// every boundary.
async fn run_loop(inner: Arc<ExecutorInner>, task_id: Uuid) {
    let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
        return;
    };

    let mut consecutive_failures: u32 = 0;
    let mut last_step_id: Option<Uuid> = None;
    let mut retry_policy = ExponentialBackoffBuilder::new()
        .with_initial_interval(inner.config.retry_initial_backoff)
        .with_max_interval(inner.config.retry_max_backoff)
        .with_max_elapsed_time(None)
        .build();

    loop {
        // Boundary: honor the durable status before doing anything.
        let mut task = match inner.tasks.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(%task_id, "runner: task vanished from store");
                break;
            }
            Err(error) => {
                tracing::warn!(%task_id, %error, "runner: store read failed");
                tokio::time::sleep(inner.config.step_backoff).await;
                continue;
            }
        };
        match task.status {
            BackgroundTaskStatus::Running => {}
            BackgroundTaskStatus::Paused => {
                tracing::debug!(%task_id, "runner yielding: task paused");
                break;
            }
            other => {
                tracing::debug!(%task_id, status = %other, "runner exiting");
                break;
            }
        }

        let now = Utc::now();
        if task.deadline_exceeded(now) {
            finalize(
                &inner,
                task,
                BackgroundTaskStatus::Timeout,
                Some("wall-clock deadline exceeded".to_string()),
                false,
            )
            .await;
            break;
        }
        if task.current_step >= task.max_steps {
            let max_steps = task.max_steps;
            finalize(
                &inner,
                task,
                BackgroundTaskStatus::Failed,
                Some(format!("step budget exhausted ({max_steps} steps)")),
                true,
            )
            .await;
            break;
        }

        let driver = inner.drivers.read().await.get(&task.agent_id).cloned();
        let Some(driver) = driver else {
            finalize(
                &inner,
                task,
                BackgroundTaskStatus::Failed,
                Some("no driver registered for agent".to_string()),
                true,
            )
            .await;
            break;
        };

        let prior = match inner.steps.list_for_task(task_id).await {
            Ok(prior) => prior,
            Err(error) => {
                tracing::warn!(%task_id, %error, "runner: failed to load prior steps");
                Vec::new()
            }
        };

        let remaining = remaining_deadline(&task, now);
        let step_started = Instant::now();
        let action = match tokio::time::timeout(remaining, driver.next_action(&task, &prior)).await
        {
            Err(_) => {
                finalize(
                    &inner,
                    task,
                    BackgroundTaskStatus::Timeout,
                    Some("step exceeded the wall-clock deadline".to_string()),
                    false,
                )
                .await;
                break;
            }
            Ok(Err(error)) => {
                consecutive_failures += 1;
                if consecutive_failures >= 2 {
                    finalize(
                        &inner,
                        task,
                        BackgroundTaskStatus::Failed,
                        Some(format!("step failed twice: {error}")),
                        true,
                    )
                    .await;
                    break;
                }
                let delay =
                    retry_policy.next_backoff().unwrap_or(inner.config.retry_max_backoff);
                tracing::warn!(%task_id, %error, ?delay, "step failed, retrying in place");
                tokio::time::sleep(delay).await;
                continue;
            }
            Ok(Ok(action)) => action,
        };

        let step_number = task.current_step + 1;
        let mut step = TaskStep::new(task_id, step_number, &action);
        step.prior_step_id = last_step_id;
        let mut tool_boundary = false;

        match &action {
            StepAction::ToolCall { tool, input } => {
                tool_boundary = true;
                match inner.skills.dispatch(tool, input.clone(), remaining).await {
                    Ok(output) => step.output = output,
                    Err(error) => {
                        // Same in-place retry as a failed driver call:
                        // nothing is recorded and the step counter does
                        // not advance until the retry is exhausted.
                        consecutive_failures += 1;
                        if consecutive_failures >= 2 {
                            finalize(
                                &inner,
                                task,
                                BackgroundTaskStatus::Failed,
                                Some(format!("tool call failed twice: {error}")),
                                true,
                            )
                            .await;
                            break;
                        }
                        let delay = retry_policy
                            .next_backoff()
                            .unwrap_or(inner.config.retry_max_backoff);
                        tracing::warn!(
                            %task_id, %error, ?delay,
                            "tool dispatch failed, retrying in place"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            }
            StepAction::Emit { message } => {
                inner
                    .bus
                    .emit(
                        EventKind::Message,
                        json!({
                            "background_task_id": task_id.to_string(),
                            "content": message,
                        }),
                        Some(task.agent_id),
                    )
                    .await;
            }
            StepAction::Complete { .. } => {}
        }

        step.duration_ms = step_started.elapsed().as_millis() as u64;
        if let Err(error) = inner.steps.create(&step).await {
            tracing::warn!(%task_id, %error, "failed to persist step");
        }
        last_step_id = Some(step.id);
        task.current_step = step_number;

        inner
            .bus
            .emit(
                EventKind::TaskStep,
                json!({
                    "task_id": task_id.to_string(),
                    "step": step_number,
                    "action": step.action,
                    "tool": step.tool,
                    "success": step.success,
                }),
                Some(task.agent_id),
            )
            .await;

        if let StepAction::Complete { result } = action {
            task.result = Some(result);
            finalize(&inner, task, BackgroundTaskStatus::Completed, None, false).await;
            break;
        }

        // Checkpoint on the interval and at tool-call boundaries.
        if tool_boundary || step_number % task.checkpoint_interval.max(1) == 0 {
            task.checkpoint = Some(Checkpoint {
                step: step_number,
                context: json!({
                    "goal_context": task.goal_context,
                    "last_output": step.output,
                }),
                at: now,
            });
            task.last_checkpoint_at = Some(Utc::now());
            inner
                .bus
                .emit(
                    EventKind::CheckpointWritten,
                    json!({ "task_id": task_id.to_string(), "step": step_number }),
                    Some(task.agent_id),
                )
                .await;
        }

        if let Err(error) = inner.tasks.update(&task).await {
            tracing::warn!(%task_id, %error, "failed to persist progress");
        }

        consecutive_failures = 0;
        retry_policy.reset();

        // Cooperative yield before the next iteration.
        tokio::time::sleep(inner.config.step_backoff).await;
    }

    let mut runners = inner.runners.lock().await;
    runners.remove(&task_id);
}

fn remaining_deadline(task: &BackgroundTask, now: chrono::DateTime<Utc>) -> Duration {
    let total = Duration::from_secs(task.timeout_seconds);
    match task.started_at {
        None => total,
        Some(started) => {
            let elapsed = now.signed_duration_since(started).to_std().unwrap_or_default();
            total.saturating_sub(elapsed).max(Duration::from_millis(1))
        }
    }
}

/// Terminal transition via CAS; a lost race means another writer owns
/// the task's fate, and the durable state is honored.
async fn finalize(
    inner: &Arc<ExecutorInner>,
    mut task: BackgroundTask,
    status: BackgroundTaskStatus,
    error: Option<String>,
    escalate: bool,
) {
    let task_id = task.id;
    match inner
        .tasks
        .compare_and_set_status(task_id, BackgroundTaskStatus::Running, status)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(%task_id, target = %status, "finalize lost the race, honoring store");
            return;
        }
        Err(store_error) => {
            tracing::warn!(%task_id, %store_error, "finalize failed to reach the store");
            return;
        }
    }

    task.status = status;
    task.completed_at = Some(Utc::now());
    if error.is_some() {
        task.error = error.clone();
    }
    if let Err(store_error) = inner.tasks.update(&task).await {
        tracing::warn!(%task_id, %store_error, "failed to persist terminal task state");
    }

    let kind = match status {
        BackgroundTaskStatus::Completed => EventKind::BackgroundTaskCompleted,
        BackgroundTaskStatus::Timeout => EventKind::BackgroundTaskTimeout,
        _ => EventKind::BackgroundTaskFailed,
    };
    inner
        .bus
        .emit(
            kind,
            json!({
                "task_id": task_id.to_string(),
                "steps": task.current_step,
                "error": task.error,
            }),
            Some(task.agent_id),
        )
        .await;

    if escalate {
        tracing::warn!(%task_id, error = task.error.as_deref().unwrap_or("-"), "background task escalation");
        inner
            .bus
            .emit(
                EventKind::Escalation,
                json!({
                    "background_task_id": task_id.to_string(),
                    "reason": task.error,
                }),
                Some(task.agent_id),
            )
            .await;
    }
}
