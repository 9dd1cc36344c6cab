use thiserror::Error;

use crate::core::apps::AppStatus;

/// Errors surfaced to callers of the runtime façade.
///
/// Run-level failures never appear here: they are recorded on the run row
/// and fed to the auto-pause guard instead.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("app {app_id} is not runnable in state {status}")]
    AppNotRunnable { app_id: String, status: AppStatus },

    #[error("app {0} has no subscriptions to activate")]
    NoSubscriptions(String),

    #[error("subscription {index} of app {app_id} is invalid: {reason}")]
    InvalidSubscription {
        app_id: String,
        index: usize,
        reason: String,
    },

    #[error("no pending escalation {entry_id} for app {app_id}")]
    EscalationNotFound { app_id: String, entry_id: String },

    #[error("app {0} is already running or queued")]
    ConcurrencyLimit(String),

    #[error("runtime is shutting down: {0}")]
    ShuttingDown(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl RuntimeError {
    /// Structural errors are caller mistakes; everything else is infrastructure.
    pub fn is_structural(&self) -> bool {
        !matches!(self, RuntimeError::Internal(_) | RuntimeError::ShuttingDown(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_errors_are_classified() {
        assert!(RuntimeError::AppNotFound("a".into()).is_structural());
        assert!(RuntimeError::ConcurrencyLimit("a".into()).is_structural());
        assert!(!RuntimeError::ShuttingDown("bye".into()).is_structural());
        assert!(!RuntimeError::Internal(anyhow::anyhow!("db gone")).is_structural());
    }

    #[test]
    fn not_runnable_message_names_status() {
        let err = RuntimeError::AppNotRunnable {
            app_id: "digest".into(),
            status: AppStatus::Paused,
        };
        assert_eq!(err.to_string(), "app digest is not runnable in state paused");
    }
}
