//! Installed apps as the runtime sees them, and the registry contract that
//! owns their persisted status.

mod sqlite;

pub use sqlite::SqliteAppRegistry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::activity::RunStatus;
use crate::core::collab::events::MatchRule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppKind {
    Automation,
    Assistant,
}

impl AppKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AppKind::Automation => "automation",
            AppKind::Assistant => "assistant",
        }
    }

    pub fn from_kind(value: &str) -> Option<Self> {
        match value {
            "automation" => Some(AppKind::Automation),
            "assistant" => Some(AppKind::Assistant),
            _ => None,
        }
    }
}

/// Stored lifecycle status of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Installed,
    Active,
    Paused,
    WaitingUser,
    Error,
}

impl AppStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppStatus::Installed => "installed",
            AppStatus::Active => "active",
            AppStatus::Paused => "paused",
            AppStatus::WaitingUser => "waiting_user",
            AppStatus::Error => "error",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "installed" => Some(AppStatus::Installed),
            "active" => Some(AppStatus::Active),
            "paused" => Some(AppStatus::Paused),
            "waiting_user" => Some(AppStatus::WaitingUser),
            "error" => Some(AppStatus::Error),
            _ => None,
        }
    }

    /// Statuses whose registrations should be live.
    pub fn wants_activation(self) -> bool {
        matches!(self, AppStatus::Active | AppStatus::WaitingUser)
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative trigger source inside an app spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionSource {
    Schedule {
        #[serde(default)]
        every: Option<String>,
        #[serde(default)]
        cron: Option<String>,
    },
    File {
        path: String,
        #[serde(default)]
        events: Vec<String>,
    },
    Webhook {
        hook: String,
    },
    Webpage {
        url: String,
    },
    Rss {
        url: String,
    },
}

impl SubscriptionSource {
    pub fn label(&self) -> &'static str {
        match self {
            SubscriptionSource::Schedule { .. } => "schedule",
            SubscriptionSource::File { .. } => "file",
            SubscriptionSource::Webhook { .. } => "webhook",
            SubscriptionSource::Webpage { .. } => "webpage",
            SubscriptionSource::Rss { .. } => "rss",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub source: SubscriptionSource,
    /// Extra payload rules narrowing an event-sourced subscription.
    #[serde(default)]
    pub filter: Vec<MatchRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub notify_on_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
    #[serde(default)]
    pub output: OutputConfig,
    /// Overrides the runtime-wide escalation timeout.
    #[serde(default)]
    pub escalation_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppRecord {
    pub id: String,
    pub name: String,
    pub kind: AppKind,
    pub status: AppStatus,
    pub spec: AppSpec,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub last_run_status: Option<RunStatus>,
}

impl AppRecord {
    pub fn automation(id: &str, name: &str, spec: AppSpec) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            kind: AppKind::Automation,
            status: AppStatus::Installed,
            spec,
            config: serde_json::json!({}),
            error_message: None,
            last_run_at: None,
            last_run_status: None,
        }
    }

    pub fn is_automation(&self) -> bool {
        self.kind == AppKind::Automation
    }
}

/// Extra fields written alongside a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusExtra {
    pub error_message: Option<String>,
}

impl StatusExtra {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppStatusChange {
    pub app_id: String,
    pub previous: Option<AppStatus>,
    pub status: AppStatus,
}

#[derive(Debug, Clone, Default)]
pub struct AppFilter {
    pub statuses: Vec<AppStatus>,
    pub kind: Option<AppKind>,
}

impl AppFilter {
    pub fn automations_in(statuses: &[AppStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            kind: Some(AppKind::Automation),
        }
    }

    pub fn matches(&self, app: &AppRecord) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&app.status))
            && self.kind.is_none_or(|k| k == app.kind)
    }
}

/// Owner of installed apps and their persisted status.
#[async_trait]
pub trait AppRegistry: Send + Sync {
    async fn get_app(&self, id: &str) -> Result<Option<AppRecord>>;

    async fn update_status(&self, id: &str, status: AppStatus, extra: StatusExtra) -> Result<()>;

    async fn update_last_run(&self, id: &str, outcome: RunStatus, error: Option<&str>)
    -> Result<()>;

    /// Every stored status flip, including ones the runtime itself makes.
    fn on_app_status_change(&self) -> broadcast::Receiver<AppStatusChange>;

    async fn list_apps(&self, filter: &AppFilter) -> Result<Vec<AppRecord>>;
}
