//! Shared test fixtures.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use gathering::adapters::sqlite::create_migrated_test_pool;
use gathering::domain::errors::{CoreError, CoreResult};
use gathering::domain::models::{BackgroundTask, StepAction, TaskStep};
use gathering::domain::ports::{AgentDriver, SkillDispatcher};
use gathering::infrastructure::config::CoreConfig;
use gathering::CoreContext;

/// A fresh context over an in-memory migrated database.
pub async fn test_context() -> Arc<CoreContext> {
    let pool = create_migrated_test_pool().await.expect("test pool");
    CoreContext::with_pool(CoreConfig::default(), pool)
}

/// A fresh context with a custom skill dispatcher wired in.
pub async fn test_context_with_skills(skills: Arc<dyn SkillDispatcher>) -> Arc<CoreContext> {
    let pool = create_migrated_test_pool().await.expect("test pool");
    CoreContext::with_pool_and_skills(CoreConfig::default(), pool, skills)
}

/// Driver that replays a script of actions, then keeps emitting.
pub struct ScriptedDriver {
    script: Mutex<VecDeque<CoreResult<StepAction>>>,
}

impl ScriptedDriver {
    pub fn new(script: Vec<CoreResult<StepAction>>) -> Arc<Self> {
        Arc::new(Self { script: Mutex::new(script.into_iter().collect()) })
    }

    pub fn completing(result: &str) -> Arc<Self> {
        Self::new(vec![Ok(StepAction::Complete { result: result.to_string() })])
    }

    pub fn failing_n_then_complete(failures: usize, result: &str) -> Arc<Self> {
        let mut script: Vec<CoreResult<StepAction>> = (0..failures)
            .map(|i| Err(CoreError::External(format!("induced failure {i}"))))
            .collect();
        script.push(Ok(StepAction::Complete { result: result.to_string() }));
        Self::new(script)
    }
}

#[async_trait]
impl AgentDriver for ScriptedDriver {
    async fn next_action(
        &self,
        _task: &BackgroundTask,
        _prior_steps: &[TaskStep],
    ) -> CoreResult<StepAction> {
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(action) => action,
            None => Ok(StepAction::Emit { message: "tick".to_string() }),
        }
    }
}

/// Dispatcher that fails the first `failures` calls, then echoes the
/// tool input back.
pub struct FlakyDispatcher {
    remaining_failures: Mutex<usize>,
}

impl FlakyDispatcher {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self { remaining_failures: Mutex::new(failures) })
    }
}

#[async_trait]
impl SkillDispatcher for FlakyDispatcher {
    async fn dispatch(
        &self,
        tool: &str,
        input: serde_json::Value,
        _deadline: Duration,
    ) -> CoreResult<serde_json::Value> {
        {
            let mut left = self.remaining_failures.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(CoreError::External(format!("induced {tool} outage")));
            }
        }
        Ok(serde_json::json!({ "tool": tool, "echo": input }))
    }
}

/// Driver that blocks until the test grants a step permit, making the
/// runner's progress fully deterministic.
pub struct GatedDriver {
    gate: Arc<Semaphore>,
    action: StepAction,
}

impl GatedDriver {
    pub fn new() -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let driver = Arc::new(Self {
            gate: gate.clone(),
            action: StepAction::Emit { message: "gated step".to_string() },
        });
        (driver, gate)
    }
}

#[async_trait]
impl AgentDriver for GatedDriver {
    async fn next_action(
        &self,
        _task: &BackgroundTask,
        _prior_steps: &[TaskStep],
    ) -> CoreResult<StepAction> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| CoreError::External("gate closed".to_string()))?;
        permit.forget();
        Ok(self.action.clone())
    }
}

/// Poll until `predicate` returns true or the deadline passes.
pub async fn wait_for<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
