use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::trigger::TriggerContext;
use super::{RunTicket, RuntimeInner};
use crate::core::activity::{ActivityEntry, EntryContent, EntryType, NewEntry, UserResponse, now_ms};
use crate::core::apps::{AppStatus, StatusExtra};
use crate::error::{RuntimeError, RuntimeResult};

/// The user's answer to a pending escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationAnswer {
    Choice(String),
    Text(String),
}

impl EscalationAnswer {
    fn into_response(self, ts: i64) -> UserResponse {
        match self {
            EscalationAnswer::Choice(choice) => UserResponse::choice(choice, ts),
            EscalationAnswer::Text(text) => UserResponse::text(text, ts),
        }
    }
}

fn human_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

impl RuntimeInner {
    /// Record the user's answer and start a follow-up run without waiting
    /// for it.
    pub(crate) async fn respond_to_escalation(
        self: &Arc<Self>,
        app_id: &str,
        entry_id: &str,
        answer: EscalationAnswer,
    ) -> RuntimeResult<RunTicket> {
        let not_found = || RuntimeError::EscalationNotFound {
            app_id: app_id.to_string(),
            entry_id: entry_id.to_string(),
        };
        let entry = self
            .store
            .get_entry(entry_id)
            .await?
            .filter(|e| e.app_id == app_id && e.is_pending_escalation())
            .ok_or_else(not_found)?;

        let gate = self.escalation_gate.lock().await;
        let mut app = self
            .registry
            .get_app(app_id)
            .await?
            .ok_or_else(|| RuntimeError::AppNotFound(app_id.to_string()))?;
        // Paused or failed apps keep the question open for after a resume.
        if !matches!(app.status, AppStatus::Active | AppStatus::WaitingUser) {
            return Err(RuntimeError::AppNotRunnable {
                app_id: app_id.to_string(),
                status: app.status,
            });
        }

        let response = answer.into_response(now_ms());
        if !self
            .store
            .resolve_escalation(app_id, entry_id, &response)
            .await?
        {
            // Lost the race to another responder or the timeout sweep.
            return Err(not_found());
        }
        info!("Escalation {} of app '{}' answered", entry_id, app_id);
        self.notifier
            .escalation_resolved(app_id, entry_id, &response);

        if app.status == AppStatus::WaitingUser {
            let still_waiting = self.store.latest_pending_escalation(app_id, None).await?;
            if still_waiting.is_none() {
                self.registry
                    .update_status(app_id, AppStatus::Active, StatusExtra::default())
                    .await?;
                app.status = AppStatus::Active;
            }
        }
        drop(gate);

        let trigger = TriggerContext::escalation_followup(&entry, &response, Utc::now());
        let pending = self.pending.enter(app_id);
        Ok(self.spawn_run(app, trigger, pending))
    }

    /// Park the app in `waiting_user` while the run's escalation is still
    /// open. Returns whether the app was parked.
    pub(crate) async fn enter_waiting_user(&self, app_id: &str, run_id: &str) -> bool {
        let _gate = self.escalation_gate.lock().await;
        if !self.has_pending_escalation(app_id, Some(run_id)).await {
            debug!(
                "Escalation of run {} was settled before app '{}' could wait on it",
                run_id, app_id
            );
            return false;
        }
        if let Err(e) = self
            .registry
            .update_status(app_id, AppStatus::WaitingUser, StatusExtra::default())
            .await
        {
            warn!("Could not mark app '{}' waiting_user: {}", app_id, e);
            return false;
        }
        // Answers written straight to the store do not take the gate.
        if self.has_pending_escalation(app_id, None).await {
            return true;
        }
        info!("App '{}' was answered while parking; back to active", app_id);
        if let Err(e) = self
            .registry
            .update_status(app_id, AppStatus::Active, StatusExtra::default())
            .await
        {
            warn!("Could not move app '{}' back to active: {}", app_id, e);
        }
        false
    }

    async fn has_pending_escalation(&self, app_id: &str, run_id: Option<&str>) -> bool {
        match self.store.latest_pending_escalation(app_id, run_id).await {
            Ok(entry) => entry.is_some(),
            Err(e) => {
                warn!("Escalation lookup for app '{}' failed: {}", app_id, e);
                false
            }
        }
    }

    fn escalation_timeout_for(&self, app_timeout_secs: Option<u64>) -> Duration {
        app_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.escalation_timeout())
    }

    /// Time out every pending escalation older than its app's timeout.
    /// The conditional resolve makes each entry time out at most once.
    pub(crate) async fn sweep_escalation_timeouts(&self, now: i64) -> RuntimeResult<Vec<String>> {
        let pending = self.store.pending_escalations().await?;
        let mut timed_out = Vec::new();
        for entry in pending {
            let app = match self.registry.get_app(&entry.app_id).await {
                Ok(app) => app,
                Err(e) => {
                    warn!("Sweep could not load app '{}': {}", entry.app_id, e);
                    continue;
                }
            };
            let timeout =
                self.escalation_timeout_for(app.as_ref().and_then(|a| a.spec.escalation_timeout_secs));
            if now - entry.ts < timeout.as_millis() as i64 {
                continue;
            }
            match self.time_out_escalation(&entry, timeout, now).await {
                Ok(true) => timed_out.push(entry.id.clone()),
                Ok(false) => {}
                Err(e) => warn!("Timing out escalation {} failed: {}", entry.id, e),
            }
        }
        if !timed_out.is_empty() {
            info!("Escalation sweep timed out {} escalation(s)", timed_out.len());
        }
        Ok(timed_out)
    }

    async fn time_out_escalation(
        &self,
        entry: &ActivityEntry,
        timeout: Duration,
        now: i64,
    ) -> anyhow::Result<bool> {
        let _gate = self.escalation_gate.lock().await;
        if !self
            .store
            .resolve_escalation(&entry.app_id, &entry.id, &UserResponse::timeout(now))
            .await?
        {
            return Ok(false);
        }
        let question = entry
            .content
            .question
            .as_deref()
            .unwrap_or(entry.content.summary.as_str());
        let message = format!(
            "No response to \"{}\" within {}",
            question,
            human_duration(timeout)
        );
        warn!("Escalation {} of app '{}' timed out", entry.id, entry.app_id);

        match self
            .store
            .add_entry(NewEntry {
                app_id: entry.app_id.clone(),
                run_id: entry.run_id.clone(),
                session_key: entry.session_key.clone(),
                entry_type: EntryType::RunError,
                content: EntryContent::failure("Escalation timed out", message.clone()),
            })
            .await
        {
            Ok(added) => self.notifier.entry_added(&added),
            Err(e) => warn!("Could not record timeout of escalation {}: {}", entry.id, e),
        }

        if let Err(e) = self
            .registry
            .update_status(
                &entry.app_id,
                AppStatus::Error,
                StatusExtra::error(format!("Escalation timed out: {}", message)),
            )
            .await
        {
            warn!("Could not move app '{}' to error: {}", entry.app_id, e);
        }
        self.notifier
            .notify_user(&entry.app_id, "Escalation timed out", message);
        self.notifier.status_changed(&entry.app_id);
        Ok(true)
    }
}
