use tracing::{info, warn};

use super::RuntimeInner;
use crate::config::{CONSECUTIVE_ERROR_THRESHOLD, ERROR_STREAK_WINDOW};
use crate::core::activity::{AutomationRun, RunStatus};
use crate::core::apps::{AppStatus, StatusExtra};

/// Leading `error` runs in a newest-first history. Cancelled and
/// interrupted runs are passed over: they neither count nor break the streak.
pub fn leading_errors(runs: &[AutomationRun]) -> usize {
    runs.iter()
        .filter(|r| !r.was_aborted())
        .take_while(|r| r.status == RunStatus::Error)
        .count()
}

impl RuntimeInner {
    /// Move the app to `error` and deactivate it once its latest runs all
    /// failed. Returns whether it was paused.
    pub(crate) async fn check_auto_pause(&self, app_id: &str) -> bool {
        let runs = match self
            .store
            .recent_runs(app_id, ERROR_STREAK_WINDOW)
            .await
        {
            Ok(runs) => runs,
            Err(e) => {
                warn!("Auto-pause check for app '{}' failed: {}", app_id, e);
                return false;
            }
        };
        let failures = leading_errors(&runs);
        if failures < CONSECUTIVE_ERROR_THRESHOLD {
            return false;
        }

        let last_error = runs
            .iter()
            .find(|r| !r.was_aborted())
            .and_then(|r| r.error_message.clone())
            .unwrap_or_else(|| "unknown error".to_string());
        let message = format!(
            "Auto-paused after {} consecutive failed runs. Last error: {}",
            failures, last_error
        );
        warn!("App '{}' auto-paused: {}", app_id, last_error);
        if let Err(e) = self
            .registry
            .update_status(app_id, AppStatus::Error, StatusExtra::error(message.clone()))
            .await
        {
            warn!("Could not move app '{}' to error: {}", app_id, e);
        }
        self.deactivate(app_id).await;
        self.notifier.notify_user(app_id, "Automation paused", message);
        info!("App '{}' deactivated after repeated failures", app_id);
        true
    }
}
