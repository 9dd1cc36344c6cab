use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::apps::AppRecord;
use crate::core::runtime::reporter::RunReporter;
use crate::core::runtime::trigger::TriggerContext;

/// Everything the agent needs for one run.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub app: AppRecord,
    pub trigger: TriggerContext,
    /// System prompt plus the rendered trigger description.
    pub instructions: String,
    pub run_id: String,
    pub session_key: String,
    /// Fires when the owning app is deactivated mid-run.
    pub cancel: CancellationToken,
    pub reporter: RunReporter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Ok,
    Error,
    Skipped,
    WaitingForUser,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub final_text: String,
    pub duration_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn ok(final_text: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Ok,
            final_text: final_text.into(),
            duration_ms: None,
            tokens_used: None,
            error: None,
        }
    }

    pub fn skipped(final_text: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Skipped,
            ..Self::ok(final_text)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::Error,
            error: Some(message.into()),
            ..Self::ok("")
        }
    }

    pub fn waiting_for_user(final_text: impl Into<String>) -> Self {
        Self {
            outcome: ExecutionOutcome::WaitingForUser,
            ..Self::ok(final_text)
        }
    }

    pub fn with_tokens(mut self, tokens: i64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }
}

/// The LLM-backed session that actually performs a run. Returning `Err`
/// is treated the same as an `Error` outcome.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult>;
}
