//! Automation runtime: runs installed automation apps on their schedules
//! and events through an agent, one global slot pool at a time, and keeps
//! an auditable history of every run.

pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;

pub use crate::config::RuntimeConfig;
pub use crate::core::activity::{
    ActivityEntry, ActivityStore, AutomationRun, EntryContent, EntryType, RunStatus, TriggerType,
    UserResponse,
};
pub use crate::core::apps::{
    AppKind, AppRecord, AppRegistry, AppSpec, AppStatus, SqliteAppRegistry, Subscription,
    SubscriptionSource,
};
pub use crate::core::collab::{
    AgentExecutor, CronScheduler, EventBus, ExecutionRequest, ExecutionResult, KeepAlive,
    KeepAliveRegistry, LocalEventBus, Scheduler,
};
pub use crate::core::runtime::{
    AppRunState, AppRuntime, AppStateView, EscalationAnswer, RunReporter, RunResult, RunTicket,
    RuntimeDeps, RuntimeEvent, SyncReport,
};
pub use crate::error::{RuntimeError, RuntimeResult};
