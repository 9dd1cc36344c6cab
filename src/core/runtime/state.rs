use serde::Serialize;

use super::RuntimeInner;
use super::guard::leading_errors;
use crate::config::ERROR_STREAK_WINDOW;
use crate::core::activity::{ActivityEntry, AutomationRun};
use crate::core::apps::AppStatus;
use crate::error::{RuntimeError, RuntimeResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppRunState {
    Idle,
    Running,
    Queued,
    Paused,
    WaitingUser,
    Error,
}

/// Read-only projection of one app for UIs and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppStateView {
    pub app_id: String,
    pub status: AppStatus,
    pub state: AppRunState,
    pub active: bool,
    pub running: usize,
    pub queued: usize,
    pub last_run: Option<AutomationRun>,
    pub consecutive_errors: usize,
    pub next_run_at_ms: Option<i64>,
    pub pending_escalation: Option<ActivityEntry>,
    pub error_message: Option<String>,
}

/// Live activity wins over stored status.
pub fn derive_run_state(status: AppStatus, running: usize, pending: usize) -> AppRunState {
    if running > 0 {
        return AppRunState::Running;
    }
    if pending > 0 {
        return AppRunState::Queued;
    }
    match status {
        AppStatus::Installed | AppStatus::Active => AppRunState::Idle,
        AppStatus::Paused => AppRunState::Paused,
        AppStatus::WaitingUser => AppRunState::WaitingUser,
        AppStatus::Error => AppRunState::Error,
    }
}

impl RuntimeInner {
    pub(crate) async fn get_app_state(&self, app_id: &str) -> RuntimeResult<AppStateView> {
        let app = self
            .registry
            .get_app(app_id)
            .await?
            .ok_or_else(|| RuntimeError::AppNotFound(app_id.to_string()))?;

        let running = self.in_flight.running_count(app_id);
        let pending = self.pending.count(app_id);
        let queued = pending.saturating_sub(running);

        let recent = self.store.recent_runs(app_id, ERROR_STREAK_WINDOW).await?;
        let consecutive_errors = leading_errors(&recent);
        let last_run = recent.into_iter().next();

        let (active, job_ids) = match self.activations.lock().await.get(app_id) {
            Some(state) => (true, state.job_ids.clone()),
            None => (false, Vec::new()),
        };
        let mut next_run_at_ms: Option<i64> = None;
        for id in &job_ids {
            if let Some(next) = self
                .scheduler
                .get_job(id)
                .await?
                .and_then(|job| job.next_run_at_ms)
            {
                next_run_at_ms = Some(next_run_at_ms.map_or(next, |n| n.min(next)));
            }
        }

        let pending_escalation = self.store.latest_pending_escalation(app_id, None).await?;

        Ok(AppStateView {
            app_id: app.id,
            status: app.status,
            state: derive_run_state(app.status, running, queued),
            active,
            running,
            queued,
            last_run,
            consecutive_errors,
            next_run_at_ms,
            pending_escalation,
            error_message: app.error_message,
        })
    }
}
