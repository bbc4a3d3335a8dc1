//! Agent driver boundary for background goal loops.
//!
//! The executor is agnostic of how an agent thinks; on each step it asks
//! the driver registered for the task's agent what to do next, passing
//! the goal, accumulated context, and prior step records.

use async_trait::async_trait;

use crate::domain::errors::CoreResult;
use crate::domain::models::{BackgroundTask, StepAction, TaskStep};

/// Produces the next action of a goal loop.
#[async_trait]
pub trait AgentDriver: Send + Sync {
    async fn next_action(
        &self,
        task: &BackgroundTask,
        prior_steps: &[TaskStep],
    ) -> CoreResult<StepAction>;
}
