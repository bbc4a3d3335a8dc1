//! Skill dispatcher boundary.
//!
//! Tool dispatch and per-tool schema validation live outside the core;
//! the runner invokes this port only at tool-call boundaries.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::CoreResult;

/// Dispatches a tool call to the external skill registry.
#[async_trait]
pub trait SkillDispatcher: Send + Sync {
    /// Run `tool` with `input`. `deadline` is the remaining wall-clock
    /// budget of the calling step; implementations should honor it so
    /// cooperative cancellation stays responsive.
    async fn dispatch(&self, tool: &str, input: Value, deadline: Duration) -> CoreResult<Value>;
}

/// No-op dispatcher for contexts with no skill registry wired in.
/// Tool calls succeed with a null output and a debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSkillDispatcher;

#[async_trait]
impl SkillDispatcher for NullSkillDispatcher {
    async fn dispatch(&self, tool: &str, _input: Value, _deadline: Duration) -> CoreResult<Value> {
        tracing::debug!(tool, "null skill dispatcher: dropping tool call");
        Ok(Value::Null)
    }
}
