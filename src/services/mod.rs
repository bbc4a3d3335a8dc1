//! Service layer: the orchestration engine.
//!
//! Each service owns its own concurrency: the bus serializes handler
//! dispatch on the publishing task, the facilitator serializes metric
//! mutations, and the executor/scheduler own their runner and cache
//! maps as single writers.

pub mod background_executor;
pub mod circle;
pub mod conversation;
pub mod cron;
pub mod event_bus;
pub mod facilitator;
pub mod scheduler;

pub use background_executor::{BackgroundExecutor, ExecutorConfig};
pub use circle::{AgentWorkload, CircleConfig, CircleStatus, CircleSummary, GatheringCircle};
pub use conversation::{
    extract_mentions, CompleteHook, ConversationRunner, ConversationSettings, MessageHook,
    Participant, NO_RESPONSE_MARKER,
};
pub use cron::CronExpr;
pub use event_bus::{sink, EventBus, EventBusConfig, EventSink, SubscriptionToken};
pub use facilitator::{Facilitator, RegisteredAgent};
pub use scheduler::{Scheduler, SchedulerConfig, MIN_INTERVAL_SECONDS};
