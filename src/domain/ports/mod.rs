//! Domain ports (interfaces) for the gathering orchestration core.

pub mod driver;
pub mod skill;
pub mod store;

pub use driver::AgentDriver;
pub use skill::{NullSkillDispatcher, SkillDispatcher};
pub use store::{
    ActionRunRepository, BackgroundTaskRepository, ScheduledActionRepository, TaskStepRepository,
};
