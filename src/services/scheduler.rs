//! Scheduled action coordinator.
//!
//! A single clock loop evaluates cron / interval / one-shot schedules
//! every tick and launches background tasks through the executor.
//! Event-triggered actions fire via `on_event` (fed by an event-bus
//! wildcard sink and by explicit calls), never via the clock. Errors in
//! a tick are logged and the loop keeps running.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::models::{
    ActionRunStatus, BackgroundTask, EventKind, ScheduleSpec, ScheduledAction, ScheduledActionRun,
    ScheduledActionStatus, TriggerSource,
};
use crate::domain::ports::{ActionRunRepository, ScheduledActionRepository};

use super::background_executor::BackgroundExecutor;
use super::cron::CronExpr;
use super::event_bus::{EventBus, SubscriptionToken};

/// Minimum accepted interval between firings.
pub const MIN_INTERVAL_SECONDS: u64 = 60;

/// Tunables for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_secs(5) }
    }
}

struct InFlight {
    action_id: Uuid,
    run: ScheduledActionRun,
    task_id: Uuid,
}

struct RetrySlot {
    action_id: Uuid,
    due: DateTime<Utc>,
    attempt: u32,
}

struct SchedulerInner {
    actions: Arc<dyn ScheduledActionRepository>,
    runs: Arc<dyn ActionRunRepository>,
    executor: BackgroundExecutor,
    bus: Arc<EventBus>,
    /// In-memory cache of active actions, refreshed from the store on
    /// every tick. Single-writer: only the scheduler mutates it.
    cache: RwLock<HashMap<Uuid, ScheduledAction>>,
    /// Live runs keyed by run id; an action allowing concurrency can
    /// have several at once.
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    retries: Mutex<Vec<RetrySlot>>,
    running: AtomicBool,
    tick_handle: Mutex<Option<JoinHandle<()>>>,
    bus_token: Mutex<Option<SubscriptionToken>>,
    config: SchedulerConfig,
}

/// Fires cron / interval / once / event schedules into the executor.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(
        actions: Arc<dyn ScheduledActionRepository>,
        runs: Arc<dyn ActionRunRepository>,
        executor: BackgroundExecutor,
        bus: Arc<EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                actions,
                runs,
                executor,
                bus,
                cache: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                retries: Mutex::new(Vec::new()),
                running: AtomicBool::new(false),
                tick_handle: Mutex::new(None),
                bus_token: Mutex::new(None),
                config,
            }),
        }
    }

    // -- Action management --------------------------------------------

    /// Validate and persist an action, computing its first firing time.
    pub async fn upsert_action(&self, mut action: ScheduledAction) -> CoreResult<Uuid> {
        validate_action(&action)?;
        if action.next_run_at.is_none() {
            action.next_run_at = first_run_at(&action.schedule, Utc::now())?;
        }
        action.updated_at = Utc::now();
        self.inner.actions.upsert(&action).await?;
        if action.status == ScheduledActionStatus::Active {
            self.inner.cache.write().await.insert(action.id, action.clone());
        }
        self.inner
            .bus
            .emit(
                EventKind::ScheduleRegistered,
                json!({
                    "action_id": action.id.to_string(),
                    "name": action.name,
                    "schedule_type": action.schedule.schedule_type(),
                }),
                None,
            )
            .await;
        Ok(action.id)
    }

    pub async fn pause_action(&self, id: Uuid) -> CoreResult<()> {
        let mut action = self.require(id).await?;
        action.status = ScheduledActionStatus::Paused;
        action.updated_at = Utc::now();
        self.inner.actions.upsert(&action).await?;
        self.inner.cache.write().await.remove(&id);
        Ok(())
    }

    pub async fn resume_action(&self, id: Uuid) -> CoreResult<()> {
        let mut action = self.require(id).await?;
        if action.status != ScheduledActionStatus::Paused {
            return Err(CoreError::InvalidState(format!(
                "action {id} is {} and cannot be resumed",
                action.status.as_str()
            )));
        }
        action.status = ScheduledActionStatus::Active;
        action.next_run_at = first_run_at(&action.schedule, Utc::now())?;
        action.updated_at = Utc::now();
        self.inner.actions.upsert(&action).await?;
        self.inner.cache.write().await.insert(id, action);
        Ok(())
    }

    pub async fn delete_action(&self, id: Uuid) -> CoreResult<()> {
        self.require(id).await?;
        self.inner.actions.delete(id).await?;
        self.inner.cache.write().await.remove(&id);
        tracing::info!(action_id = %id, "scheduled action deleted");
        Ok(())
    }

    pub async fn action(&self, id: Uuid) -> CoreResult<Option<ScheduledAction>> {
        self.inner.actions.get(id).await
    }

    pub async fn actions(&self) -> CoreResult<Vec<ScheduledAction>> {
        self.inner.actions.list(None).await
    }

    pub async fn runs_for(&self, action_id: Uuid) -> CoreResult<Vec<ScheduledActionRun>> {
        self.inner.runs.list_for_action(action_id).await
    }

    // -- Triggers -----------------------------------------------------

    /// Fire an action immediately, regardless of its schedule. The
    /// concurrency policy still applies.
    pub async fn trigger_now(&self, id: Uuid) -> CoreResult<Uuid> {
        let mut action = self.require(id).await?;
        if !action.allow_concurrent && self.has_in_flight(id).await {
            return Err(CoreError::Capacity(format!(
                "action {} already has a run in flight",
                action.name
            )));
        }
        let run_id = self.fire_action(&mut action, TriggerSource::Manual, 0, None).await?;
        Ok(run_id)
    }

    /// Fire every active event-triggered action matching `event_name`.
    pub async fn on_event(&self, event_name: &str, payload: Value) -> CoreResult<usize> {
        let matching: Vec<ScheduledAction> = {
            let actions = self.inner.actions.list_active().await?;
            actions
                .into_iter()
                .filter(|a| {
                    matches!(&a.schedule, ScheduleSpec::Event { trigger } if trigger == event_name)
                })
                .collect()
        };

        let mut fired = 0;
        for mut action in matching {
            if !action.allow_concurrent && self.has_in_flight(action.id).await {
                tracing::info!(action = %action.name, "skipping event trigger: run in flight");
                continue;
            }
            if let Err(error) = self
                .fire_action(&mut action, TriggerSource::Event, 0, Some(&payload))
                .await
            {
                tracing::warn!(action = %action.name, %error, "event trigger failed");
                continue;
            }
            fired += 1;
        }
        Ok(fired)
    }

    // -- Clock loop ---------------------------------------------------

    /// Start the tick loop and the bus sink that feeds event triggers.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let scheduler = self.clone();
        let token = self.inner.bus.subscribe(
            None,
            Arc::new(move |event| {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    scheduler
                        .on_event(event.kind.as_str(), event.payload.clone())
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                })
            }),
        );
        *self.inner.bus_token.lock().await = Some(token);

        let scheduler = self.clone();
        let tick_interval = self.inner.config.tick_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while scheduler.inner.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if let Err(error) = scheduler.tick().await {
                    tracing::error!(%error, "scheduler tick failed");
                }
            }
        });
        *self.inner.tick_handle.lock().await = Some(handle);
        tracing::info!("scheduler started");
    }

    /// Stop the clock loop, waiting up to `timeout` for the current
    /// tick to finish.
    pub async fn stop(&self, timeout: Duration) {
        self.inner.running.store(false, Ordering::SeqCst);
        if let Some(token) = self.inner.bus_token.lock().await.take() {
            self.inner.bus.unsubscribe(token);
        }
        if let Some(handle) = self.inner.tick_handle.lock().await.take() {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                tracing::warn!("scheduler tick loop did not stop in time");
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One pass of the clock loop. Public so tests and embedders can
    /// drive the scheduler deterministically.
    pub async fn tick(&self) -> CoreResult<()> {
        self.sweep_completed().await?;
        self.fire_due_retries().await?;

        // Re-hydrate the cache; the store is the source of truth.
        let active = self.inner.actions.list_active().await?;
        {
            let mut cache = self.inner.cache.write().await;
            cache.clear();
            for action in &active {
                cache.insert(action.id, action.clone());
            }
        }

        let now = Utc::now();
        let mut due: Vec<ScheduledAction> = active
            .into_iter()
            .filter(|a| a.next_run_at.is_some_and(|at| at <= now))
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));

        for mut action in due {
            if action.start_date.is_some_and(|start| now < start) {
                continue;
            }
            if action.exhausted(now) {
                self.mark_completed(&mut action).await?;
                continue;
            }
            if !action.allow_concurrent && self.has_in_flight(action.id).await {
                tracing::info!(
                    action = %action.name,
                    "skipping tick: previous run still in flight"
                );
                self.inner
                    .bus
                    .emit(
                        EventKind::ScheduleSkipped,
                        json!({ "action_id": action.id.to_string(), "name": action.name }),
                        None,
                    )
                    .await;
                continue;
            }

            if let Err(error) =
                self.fire_action(&mut action, TriggerSource::Scheduler, 0, None).await
            {
                tracing::warn!(action = %action.name, %error, "failed to fire action");
            }

            action.next_run_at = match &action.schedule {
                ScheduleSpec::Cron { expression } => CronExpr::parse(expression)?.next_after(now),
                ScheduleSpec::Interval { seconds } => {
                    Some(now + chrono::Duration::seconds(*seconds as i64))
                }
                // One-shots and event triggers have no next firing.
                ScheduleSpec::Once { .. } | ScheduleSpec::Event { .. } => None,
            };
            action.updated_at = Utc::now();
            self.inner.actions.upsert(&action).await?;
            self.inner.cache.write().await.insert(action.id, action);
        }

        Ok(())
    }

    // -- Internals ----------------------------------------------------

    async fn has_in_flight(&self, action_id: Uuid) -> bool {
        self.inner
            .in_flight
            .lock()
            .await
            .values()
            .any(|entry| entry.action_id == action_id)
    }

    async fn require(&self, id: Uuid) -> CoreResult<ScheduledAction> {
        self.inner
            .actions
            .get(id)
            .await?
            .ok_or_else(|| CoreError::not_found("scheduled action", id))
    }

    /// Create a run and launch its background task. A failed launch
    /// records a failed run without advancing the execution count.
    async fn fire_action(
        &self,
        action: &mut ScheduledAction,
        source: TriggerSource,
        retry_count: u32,
        trigger_payload: Option<&Value>,
    ) -> CoreResult<Uuid> {
        let run_number = self.inner.runs.count_for_action(action.id).await? + 1;
        let mut run = ScheduledActionRun::new(action.id, run_number, source);
        run.retry_count = retry_count;

        let task = BackgroundTask::new(action.agent_id, action.goal.clone())
            .with_context(json!({
                "scheduled_action_id": action.id.to_string(),
                "action_name": action.name,
                "run_number": run_number,
                "trigger_payload": trigger_payload,
            }))
            .with_max_steps(action.max_steps)
            .with_timeout(action.timeout_seconds);

        match self.inner.executor.start_task(task).await {
            Ok(task_id) => {
                run.background_task_id = Some(task_id);
                run.started_at = Some(Utc::now());
                self.inner.runs.create(&run).await?;
                let run_id = run.id;
                self.inner
                    .in_flight
                    .lock()
                    .await
                    .insert(run_id, InFlight { action_id: action.id, run, task_id });
                self.inner
                    .bus
                    .emit(
                        EventKind::ScheduleFired,
                        json!({
                            "action_id": action.id.to_string(),
                            "name": action.name,
                            "triggered_by": source.as_str(),
                            "background_task_id": task_id.to_string(),
                        }),
                        Some(action.agent_id),
                    )
                    .await;
                Ok(run_id)
            }
            Err(error) => {
                run.status = ActionRunStatus::Failed;
                run.error = Some(error.to_string());
                run.completed_at = Some(Utc::now());
                self.inner.runs.create(&run).await?;
                self.inner
                    .bus
                    .emit(
                        EventKind::ScheduleFailed,
                        json!({
                            "action_id": action.id.to_string(),
                            "name": action.name,
                            "error": error.to_string(),
                        }),
                        None,
                    )
                    .await;
                Err(error)
            }
        }
    }

    /// Fold finished background tasks back into their runs and actions,
    /// scheduling retries where policy allows.
    async fn sweep_completed(&self) -> CoreResult<()> {
        let finished: Vec<InFlight> = {
            let mut in_flight = self.inner.in_flight.lock().await;
            let mut finished = Vec::new();
            let run_ids: Vec<Uuid> = in_flight.keys().copied().collect();
            for run_id in run_ids {
                let task_id = in_flight[&run_id].task_id;
                let done = match self.inner.executor.task(task_id).await {
                    Ok(Some(task)) => task.status.is_terminal(),
                    Ok(None) => true,
                    Err(_) => false,
                };
                if done {
                    if let Some(entry) = in_flight.remove(&run_id) {
                        finished.push(entry);
                    }
                }
            }
            finished
        };

        for entry in finished {
            let InFlight { action_id, mut run, task_id } = entry;
            let task = self.inner.executor.task(task_id).await?.ok_or_else(|| {
                CoreError::not_found("background task", task_id)
            });

            let now = Utc::now();
            run.completed_at = Some(now);
            run.duration_ms =
                now.signed_duration_since(run.triggered_at).num_milliseconds().max(0) as u64;
            let succeeded = match task {
                Ok(task) => {
                    run.steps_executed = task.current_step;
                    run.result_summary = task.result.clone();
                    run.error = task.error.clone();
                    task.status == crate::domain::models::BackgroundTaskStatus::Completed
                }
                Err(_) => false,
            };
            run.status = if succeeded { ActionRunStatus::Succeeded } else { ActionRunStatus::Failed };
            self.inner.runs.update(&run).await?;

            let Some(mut action) = self.inner.actions.get(action_id).await? else {
                continue;
            };
            action.execution_count += 1;
            action.last_run_at = Some(now);
            action.last_run_status = Some(run.status.as_str().to_string());

            if matches!(action.schedule, ScheduleSpec::Once { .. }) {
                if succeeded {
                    action.status = ScheduledActionStatus::Completed;
                } else if !action.retry_on_failure {
                    action.status = ScheduledActionStatus::Failed;
                }
            }

            // Retries honor the pause that may have happened meanwhile.
            if !succeeded
                && action.retry_on_failure
                && run.retry_count < action.max_retries
                && action.status == ScheduledActionStatus::Active
            {
                let due = now + chrono::Duration::seconds(action.retry_delay_seconds as i64);
                tracing::info!(
                    action = %action.name,
                    attempt = run.retry_count + 1,
                    "scheduling retry"
                );
                self.inner.retries.lock().await.push(RetrySlot {
                    action_id,
                    due,
                    attempt: run.retry_count + 1,
                });
            }

            action.updated_at = now;
            self.inner.actions.upsert(&action).await?;
        }
        Ok(())
    }

    async fn fire_due_retries(&self) -> CoreResult<()> {
        let now = Utc::now();
        let due: Vec<RetrySlot> = {
            let mut retries = self.inner.retries.lock().await;
            let mut due = Vec::new();
            let mut index = 0;
            while index < retries.len() {
                if retries[index].due <= now {
                    due.push(retries.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };

        for slot in due {
            let Some(mut action) = self.inner.actions.get(slot.action_id).await? else {
                continue;
            };
            // A paused or completed action is not retried.
            if action.status != ScheduledActionStatus::Active {
                tracing::info!(action = %action.name, "dropping retry: action no longer active");
                continue;
            }
            if !action.allow_concurrent && self.has_in_flight(action.id).await {
                continue;
            }
            if let Err(error) = self
                .fire_action(&mut action, TriggerSource::Retry, slot.attempt, None)
                .await
            {
                tracing::warn!(action = %action.name, %error, "retry failed to start");
            }
        }
        Ok(())
    }

    async fn mark_completed(&self, action: &mut ScheduledAction) -> CoreResult<()> {
        action.status = ScheduledActionStatus::Completed;
        action.next_run_at = None;
        action.updated_at = Utc::now();
        self.inner.actions.upsert(action).await?;
        self.inner.cache.write().await.remove(&action.id);
        self.inner
            .bus
            .emit(
                EventKind::ScheduleCompleted,
                json!({ "action_id": action.id.to_string(), "name": action.name }),
                None,
            )
            .await;
        Ok(())
    }
}

fn validate_action(action: &ScheduledAction) -> CoreResult<()> {
    if action.name.trim().is_empty() {
        return Err(CoreError::BadInput("action name cannot be empty".to_string()));
    }
    if action.goal.trim().is_empty() {
        return Err(CoreError::BadInput("action goal cannot be empty".to_string()));
    }
    match &action.schedule {
        ScheduleSpec::Cron { expression } => {
            CronExpr::parse(expression)?;
        }
        ScheduleSpec::Interval { seconds } => {
            if *seconds < MIN_INTERVAL_SECONDS {
                return Err(CoreError::BadInput(format!(
                    "interval must be at least {MIN_INTERVAL_SECONDS} seconds"
                )));
            }
        }
        ScheduleSpec::Once { .. } | ScheduleSpec::Event { .. } => {}
    }
    Ok(())
}

/// First firing time for a schedule, from `now`.
fn first_run_at(
    schedule: &ScheduleSpec,
    now: DateTime<Utc>,
) -> CoreResult<Option<DateTime<Utc>>> {
    Ok(match schedule {
        ScheduleSpec::Cron { expression } => CronExpr::parse(expression)?.next_after(now),
        ScheduleSpec::Interval { seconds } => Some(now + chrono::Duration::seconds(*seconds as i64)),
        ScheduleSpec::Once { at } => Some(*at),
        ScheduleSpec::Event { .. } => None,
    })
}
