//! Contracts of the subsystems the runtime drives but does not own, plus
//! in-process adapters for each.

pub mod agent;
pub mod events;
pub mod keepalive;
pub mod scheduler;

pub use agent::{AgentExecutor, ExecutionOutcome, ExecutionRequest, ExecutionResult};
pub use events::{
    BusEvent, EventBus, EventFilter, EventHandler, LocalEventBus, MatchRule, Unsubscribe, handler_fn,
};
pub use keepalive::{KeepAlive, KeepAliveGuard, KeepAliveRegistry};
pub use scheduler::{
    CronScheduler, DueOutcome, JobDescriptor, JobDueHandler, JobInfo, JobPayload, Schedule,
    Scheduler,
};
