//! Core context: explicit wiring of every subsystem.
//!
//! No module-level singletons. Each context owns its own bus, store
//! handles, executor, scheduler, and circles; tests instantiate a fresh
//! context per test and embedders pass it into their handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::adapters::sqlite::{
    initialize_database, SqliteActionRunRepository, SqliteBackgroundTaskRepository,
    SqliteScheduledActionRepository, SqliteTaskStepRepository,
};
use crate::domain::errors::{CoreError, CoreResult};
use crate::domain::ports::{
    ActionRunRepository, BackgroundTaskRepository, NullSkillDispatcher, ScheduledActionRepository,
    SkillDispatcher, TaskStepRepository,
};
use crate::infrastructure::config::CoreConfig;
use crate::services::{
    BackgroundExecutor, CircleConfig, ConversationSettings, EventBus, EventBusConfig,
    ExecutorConfig, GatheringCircle, Scheduler, SchedulerConfig,
};

/// One fully wired orchestration core.
pub struct CoreContext {
    pub config: CoreConfig,
    pub bus: Arc<EventBus>,
    pub pool: SqlitePool,
    pub background_tasks: Arc<dyn BackgroundTaskRepository>,
    pub task_steps: Arc<dyn TaskStepRepository>,
    pub scheduled_actions: Arc<dyn ScheduledActionRepository>,
    pub action_runs: Arc<dyn ActionRunRepository>,
    pub executor: BackgroundExecutor,
    pub scheduler: Scheduler,
    circles: RwLock<HashMap<String, Arc<GatheringCircle>>>,
}

impl CoreContext {
    /// Open the configured database and wire all subsystems, using the
    /// null skill dispatcher.
    pub async fn initialize(config: CoreConfig) -> CoreResult<Arc<Self>> {
        Self::initialize_with_skills(config, Arc::new(NullSkillDispatcher)).await
    }

    /// Wire all subsystems with an external skill dispatcher.
    pub async fn initialize_with_skills(
        config: CoreConfig,
        skills: Arc<dyn SkillDispatcher>,
    ) -> CoreResult<Arc<Self>> {
        let database_url = format!("sqlite:{}", config.database.path);
        let pool = initialize_database(&database_url)
            .await
            .map_err(|e| CoreError::External(format!("database init: {e}")))?;
        Ok(Self::wire(config, pool, skills))
    }

    /// Wire against an existing (already migrated) pool. Used by tests.
    pub fn with_pool(config: CoreConfig, pool: SqlitePool) -> Arc<Self> {
        Self::wire(config, pool, Arc::new(NullSkillDispatcher))
    }

    /// Wire against an existing pool with an external skill dispatcher.
    pub fn with_pool_and_skills(
        config: CoreConfig,
        pool: SqlitePool,
        skills: Arc<dyn SkillDispatcher>,
    ) -> Arc<Self> {
        Self::wire(config, pool, skills)
    }

    fn wire(config: CoreConfig, pool: SqlitePool, skills: Arc<dyn SkillDispatcher>) -> Arc<Self> {
        let bus = Arc::new(EventBus::new(EventBusConfig::default()));

        let background_tasks: Arc<dyn BackgroundTaskRepository> =
            Arc::new(SqliteBackgroundTaskRepository::new(pool.clone()));
        let task_steps: Arc<dyn TaskStepRepository> =
            Arc::new(SqliteTaskStepRepository::new(pool.clone()));
        let scheduled_actions: Arc<dyn ScheduledActionRepository> =
            Arc::new(SqliteScheduledActionRepository::new(pool.clone()));
        let action_runs: Arc<dyn ActionRunRepository> =
            Arc::new(SqliteActionRunRepository::new(pool.clone()));

        let executor = BackgroundExecutor::new(
            background_tasks.clone(),
            task_steps.clone(),
            skills,
            bus.clone(),
            ExecutorConfig {
                max_concurrent: config.executor.max_concurrent_runners,
                step_backoff: Duration::from_millis(config.executor.step_backoff_ms),
                ..ExecutorConfig::default()
            },
        );

        let scheduler = Scheduler::new(
            scheduled_actions.clone(),
            action_runs.clone(),
            executor.clone(),
            bus.clone(),
            SchedulerConfig {
                tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs),
            },
        );

        Arc::new(Self {
            config,
            bus,
            pool,
            background_tasks,
            task_steps,
            scheduled_actions,
            action_runs,
            executor,
            scheduler,
            circles: RwLock::new(HashMap::new()),
        })
    }

    /// Circle config derived from the context configuration.
    pub fn circle_config(&self) -> CircleConfig {
        CircleConfig {
            require_review: self.config.circle.require_review,
            auto_route: self.config.circle.auto_route,
            max_iterations: self.config.circle.max_iterations,
            max_workload: self.config.circle.max_workload,
            stop_grace: Duration::from_secs(self.config.circle.stop_grace_secs),
            conversation: ConversationSettings {
                turn_timeout: Duration::from_secs(self.config.conversation.turn_timeout_secs),
                transcript_tail: self.config.conversation.transcript_tail,
                rng_seed: None,
            },
        }
    }

    /// Create and register a circle on this context's bus.
    pub async fn create_circle(
        &self,
        name: impl Into<String>,
        config: CircleConfig,
    ) -> CoreResult<Arc<GatheringCircle>> {
        let name = name.into();
        let mut circles = self.circles.write().await;
        if circles.contains_key(&name) {
            return Err(CoreError::InvalidState(format!("circle {name} already exists")));
        }
        let circle = Arc::new(GatheringCircle::new(name.clone(), config, self.bus.clone()));
        circles.insert(name, circle.clone());
        Ok(circle)
    }

    pub async fn circle(&self, name: &str) -> Option<Arc<GatheringCircle>> {
        self.circles.read().await.get(name).cloned()
    }

    /// Recover orphaned background tasks and start the scheduler.
    pub async fn start(&self) -> CoreResult<usize> {
        let recovered = self.executor.recover_tasks().await?;
        self.scheduler.start().await;
        Ok(recovered)
    }

    /// Drain everything: scheduler first (no new launches), then the
    /// executor, then every circle.
    pub async fn shutdown(&self, timeout: Duration) {
        self.scheduler.stop(timeout).await;
        self.executor.shutdown(timeout).await;
        let circles: Vec<Arc<GatheringCircle>> =
            self.circles.read().await.values().cloned().collect();
        for circle in circles {
            if let Err(error) = circle.stop().await {
                tracing::warn!(circle = circle.name(), %error, "circle failed to stop cleanly");
            }
        }
    }
}
