//! Gathering — a multi-agent orchestration core.
//!
//! The gathering model: autonomous agents collaborate in circles, a
//! facilitator routes work without commanding, peers review submissions
//! before completion, and escalations surface to the human. Everything
//! is connected by an in-process event bus; background goal loops and
//! schedules persist through a SQLite store.
//!
//! Subsystems:
//! - [`services::EventBus`] — typed pub/sub with topic filters
//! - [`services::Facilitator`] — routing, metrics, conflict detection
//! - [`services::GatheringCircle`] — task lifecycle and conversations
//! - [`services::BackgroundExecutor`] — step-bounded goal loops
//! - [`services::Scheduler`] — cron / interval / once / event triggers
//!
//! Construct a [`context::CoreContext`] to wire them all together; no
//! process-wide state is used anywhere.

pub mod adapters;
pub mod context;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use context::CoreContext;
pub use domain::errors::{CoreError, CoreResult, ErrorKind};
