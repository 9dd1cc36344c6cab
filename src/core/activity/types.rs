use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Ok,
    Error,
    Skipped,
    WaitingUser,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Skipped => "skipped",
            RunStatus::WaitingUser => "waiting_user",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "running" => Some(RunStatus::Running),
            "ok" => Some(RunStatus::Ok),
            "error" => Some(RunStatus::Error),
            "skipped" => Some(RunStatus::Skipped),
            "waiting_user" => Some(RunStatus::WaitingUser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Schedule,
    Event,
    Manual,
    EscalationFollowup,
}

impl TriggerType {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerType::Schedule => "schedule",
            TriggerType::Event => "event",
            TriggerType::Manual => "manual",
            TriggerType::EscalationFollowup => "escalation_followup",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "schedule" => Some(TriggerType::Schedule),
            "event" => Some(TriggerType::Event),
            "manual" => Some(TriggerType::Manual),
            "escalation_followup" => Some(TriggerType::EscalationFollowup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    RunComplete,
    RunSkipped,
    RunError,
    Milestone,
    Escalation,
    Output,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::RunComplete => "run_complete",
            EntryType::RunSkipped => "run_skipped",
            EntryType::RunError => "run_error",
            EntryType::Milestone => "milestone",
            EntryType::Escalation => "escalation",
            EntryType::Output => "output",
        }
    }

    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "run_complete" => Some(EntryType::RunComplete),
            "run_skipped" => Some(EntryType::RunSkipped),
            "run_error" => Some(EntryType::RunError),
            "milestone" => Some(EntryType::Milestone),
            "escalation" => Some(EntryType::Escalation),
            "output" => Some(EntryType::Output),
            _ => None,
        }
    }
}

/// Error message of a run cut short by deactivation.
pub const RUN_CANCELLED: &str = "Run cancelled: app was deactivated";
/// Error message of a run left `running` by a previous process.
pub const RUN_INTERRUPTED: &str = "Interrupted by process restart";

/// One execution attempt of an app.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AutomationRun {
    pub run_id: String,
    pub app_id: String,
    pub session_key: String,
    pub status: RunStatus,
    pub trigger_type: TriggerType,
    pub trigger_data: serde_json::Value,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub duration_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub error_message: Option<String>,
}

impl AutomationRun {
    /// Ended by the runtime rather than by the app's own work.
    pub fn was_aborted(&self) -> bool {
        self.status == RunStatus::Error
            && matches!(
                self.error_message.as_deref(),
                Some(RUN_CANCELLED | RUN_INTERRUPTED)
            )
    }
}

#[derive(Debug, Clone)]
pub struct NewRun {
    pub run_id: String,
    pub app_id: String,
    pub session_key: String,
    pub trigger_type: TriggerType,
    pub trigger_data: serde_json::Value,
    pub started_at: i64,
}

/// Final outcome written onto a run exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct RunCompletion {
    pub status: RunStatus,
    pub finished_at: i64,
    pub duration_ms: i64,
    pub tokens_used: Option<i64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryContent {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<String>>,
}

impl EntryContent {
    pub fn summary(text: impl Into<String>) -> Self {
        Self {
            summary: text.into(),
            ..Default::default()
        }
    }

    pub fn question(question: impl Into<String>, choices: Option<Vec<String>>) -> Self {
        let question = question.into();
        Self {
            summary: question.clone(),
            question: Some(question),
            choices,
            ..Default::default()
        }
    }

    pub fn failure(summary: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// A user's answer to an escalation. Exactly one of `choice` / `text` is
/// normally set; `timed_out` marks the synthetic answer the sweep writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl UserResponse {
    pub fn choice(choice: impl Into<String>, ts: i64) -> Self {
        Self {
            choice: Some(choice.into()),
            text: None,
            ts,
            timed_out: false,
        }
    }

    pub fn text(text: impl Into<String>, ts: i64) -> Self {
        Self {
            choice: None,
            text: Some(text.into()),
            ts,
            timed_out: false,
        }
    }

    pub fn timeout(ts: i64) -> Self {
        Self {
            choice: None,
            text: Some("No response before the escalation timed out".to_string()),
            ts,
            timed_out: true,
        }
    }

    /// The literal answer as the agent should read it.
    pub fn literal(&self) -> &str {
        self.choice
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActivityEntry {
    pub id: String,
    pub app_id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub ts: i64,
    pub session_key: String,
    pub content: EntryContent,
    pub user_response: Option<UserResponse>,
}

impl ActivityEntry {
    pub fn is_pending_escalation(&self) -> bool {
        self.entry_type == EntryType::Escalation && self.user_response.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub app_id: String,
    pub run_id: String,
    pub session_key: String,
    pub entry_type: EntryType,
    pub content: EntryContent,
}
