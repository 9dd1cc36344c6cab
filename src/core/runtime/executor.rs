use anyhow::anyhow;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::RuntimeInner;
use super::notify::Notifier;
use super::reporter::RunReporter;
use super::semaphore::{PendingGuard, RunPermit};
use super::trigger::{TriggerContext, render_instructions};
use crate::core::activity::{NewRun, RUN_CANCELLED, RunCompletion, RunStatus, TriggerType, now_ms};
use crate::core::apps::AppRecord;
use crate::core::collab::{ExecutionOutcome, ExecutionRequest, ExecutionResult};
use crate::error::{RuntimeError, RuntimeResult};

const SUMMARY_LIMIT: usize = 280;

/// Identity of one in-flight execution. Two runs of the same app never
/// share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionKey {
    pub app_id: String,
    pub seq: u64,
}

impl fmt::Display for ExecutionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.app_id, self.seq)
    }
}

/// Cancellation handles of every run currently holding a slot.
#[derive(Default)]
pub struct InFlightRegistry {
    next_seq: AtomicU64,
    runs: Mutex<HashMap<ExecutionKey, CancellationToken>>,
}

impl InFlightRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutionKey, CancellationToken>> {
        match self.runs.lock() {
            Ok(runs) => runs,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, app_id: &str) -> (ExecutionKey, CancellationToken) {
        let key = ExecutionKey {
            app_id: app_id.to_string(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        let token = CancellationToken::new();
        self.lock().insert(key.clone(), token.clone());
        (key, token)
    }

    pub fn remove(&self, key: &ExecutionKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Cancel every run of one app. Entries stay until each run unwinds.
    pub fn cancel_app(&self, app_id: &str) -> usize {
        let runs = self.lock();
        let mut cancelled = 0;
        for (key, token) in runs.iter() {
            if key.app_id == app_id {
                token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let runs = self.lock();
        for token in runs.values() {
            token.cancel();
        }
        runs.len()
    }

    pub fn running_count(&self, app_id: &str) -> usize {
        self.lock().keys().filter(|k| k.app_id == app_id).count()
    }

    pub fn total(&self) -> usize {
        self.lock().len()
    }
}

/// Owns everything a run holds while executing. Dropping it removes the
/// in-flight key, frees the slot and the pending count, then publishes a
/// status change, whichever way the run ended.
struct ExecutionSlot {
    in_flight: Arc<InFlightRegistry>,
    notifier: Notifier,
    key: ExecutionKey,
    permit: Option<RunPermit>,
    pending: Option<PendingGuard>,
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
        self.permit.take();
        self.pending.take();
        self.notifier.status_changed(&self.key.app_id);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunResult {
    pub run_id: String,
    pub app_id: String,
    pub session_key: String,
    pub status: RunStatus,
    pub final_text: String,
    pub duration_ms: i64,
    pub tokens_used: Option<i64>,
    pub error_message: Option<String>,
}

/// Agent result folded into run terms.
#[derive(Debug, Clone, PartialEq)]
struct Normalized {
    status: RunStatus,
    final_text: String,
    duration_ms: Option<i64>,
    tokens_used: Option<i64>,
    error: Option<String>,
}

fn normalize(result: anyhow::Result<ExecutionResult>, cancelled: bool) -> Normalized {
    match result {
        Ok(res) => {
            let status = match res.outcome {
                ExecutionOutcome::Ok => RunStatus::Ok,
                ExecutionOutcome::Error => RunStatus::Error,
                ExecutionOutcome::Skipped => RunStatus::Skipped,
                ExecutionOutcome::WaitingForUser => RunStatus::WaitingUser,
            };
            let error = match status {
                RunStatus::Error => Some(
                    res.error
                        .clone()
                        .filter(|e| !e.trim().is_empty())
                        .unwrap_or_else(|| "agent reported an error".to_string()),
                ),
                _ => None,
            };
            Normalized {
                status,
                final_text: res.final_text,
                duration_ms: res.duration_ms,
                tokens_used: res.tokens_used,
                error,
            }
        }
        Err(e) => Normalized {
            status: RunStatus::Error,
            final_text: String::new(),
            duration_ms: None,
            tokens_used: None,
            error: Some(if cancelled {
                RUN_CANCELLED.to_string()
            } else {
                e.to_string()
            }),
        },
    }
}

fn summarize(text: &str, fallback: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return fallback.to_string();
    }
    if text.chars().count() <= SUMMARY_LIMIT {
        return text.to_string();
    }
    let cut: String = text.chars().take(SUMMARY_LIMIT).collect();
    format!("{}...", cut.trim_end())
}

impl RuntimeInner {
    /// Gate a run behind the global semaphore and drive it to completion.
    /// The pending guard is held until the run's slot is released.
    pub(crate) async fn execute_with_concurrency(
        &self,
        app: AppRecord,
        trigger: TriggerContext,
        pending: PendingGuard,
    ) -> RuntimeResult<RunResult> {
        let permit = match self.semaphore.try_acquire() {
            Some(permit) => permit,
            None => {
                info!(
                    "App '{}' queued: all {} run slots busy",
                    app.id,
                    self.semaphore.capacity()
                );
                self.notifier.status_changed(&app.id);
                let permit = self.semaphore.acquire().await?;
                // Deactivated while queued: drop signal-driven runs.
                if matches!(trigger.trigger_type, TriggerType::Schedule | TriggerType::Event)
                    && !self.is_activated(&app.id).await
                {
                    return Err(RuntimeError::AppNotRunnable {
                        app_id: app.id.clone(),
                        status: app.status,
                    });
                }
                permit
            }
        };

        let (key, cancel) = self.in_flight.register(&app.id);
        let _slot = ExecutionSlot {
            in_flight: self.in_flight.clone(),
            notifier: self.notifier.clone(),
            key,
            permit: Some(permit),
            pending: Some(pending),
        };
        self.notifier.status_changed(&app.id);

        Ok(self.run_once(&app, &trigger, cancel).await)
    }

    async fn run_once(
        &self,
        app: &AppRecord,
        trigger: &TriggerContext,
        cancel: CancellationToken,
    ) -> RunResult {
        let run_id = uuid::Uuid::new_v4().to_string();
        let session_key = format!("automation:{}:{}", app.id, run_id);
        let clock = Instant::now();

        info!(
            "Run {} of app '{}' started ({})",
            run_id,
            app.id,
            trigger.trigger_type.as_str()
        );
        if let Err(e) = self
            .store
            .create_run(NewRun {
                run_id: run_id.clone(),
                app_id: app.id.clone(),
                session_key: session_key.clone(),
                trigger_type: trigger.trigger_type,
                trigger_data: trigger.to_trigger_data(),
                started_at: now_ms(),
            })
            .await
        {
            error!("Could not record run for app '{}': {}", app.id, e);
            return RunResult {
                run_id,
                app_id: app.id.clone(),
                session_key,
                status: RunStatus::Error,
                final_text: String::new(),
                duration_ms: 0,
                tokens_used: None,
                error_message: Some(format!("failed to record run: {}", e)),
            };
        }

        let reporter = RunReporter::new(
            self.store.clone(),
            self.notifier.clone(),
            &app.id,
            &run_id,
            &session_key,
        );
        let request = ExecutionRequest {
            app: app.clone(),
            trigger: trigger.clone(),
            instructions: render_instructions(app, trigger),
            run_id: run_id.clone(),
            session_key: session_key.clone(),
            cancel: cancel.clone(),
            reporter: reporter.clone(),
        };

        let result = tokio::select! {
            res = self.agent.execute(request) => res,
            _ = cancel.cancelled() => Err(anyhow!("cancelled")),
        };
        let cancelled = cancel.is_cancelled();
        let mut outcome = normalize(result, cancelled);

        let mut escalation = None;
        if outcome.status == RunStatus::WaitingUser {
            match self
                .store
                .latest_pending_escalation(&app.id, Some(&run_id))
                .await
            {
                Ok(Some(entry)) => escalation = Some(entry),
                Ok(None) => {
                    warn!(
                        "Run {} of app '{}' waits for the user but raised no escalation; recording as ok",
                        run_id, app.id
                    );
                    outcome.status = RunStatus::Ok;
                }
                Err(e) => warn!("Escalation lookup for run {} failed: {}", run_id, e),
            }
        }

        self.ensure_timeline_entry(&reporter, &outcome).await;

        let duration_ms = outcome
            .duration_ms
            .unwrap_or_else(|| clock.elapsed().as_millis() as i64);
        let completion = RunCompletion {
            status: outcome.status,
            finished_at: now_ms(),
            duration_ms,
            tokens_used: outcome.tokens_used,
            error_message: outcome.error.clone(),
        };
        match self.store.finish_run(&run_id, &completion).await {
            Ok(true) => {}
            Ok(false) => warn!("Run {} was already finished", run_id),
            Err(e) => error!("Could not record outcome of run {}: {}", run_id, e),
        }
        info!(
            "Run {} of app '{}' finished: {} in {}ms",
            run_id,
            app.id,
            outcome.status.as_str(),
            duration_ms
        );

        if let Some(entry) = escalation
            && self.enter_waiting_user(&app.id, &run_id).await
        {
            info!("App '{}' waiting for user on escalation {}", app.id, entry.id);
        }

        if let Err(e) = self
            .registry
            .update_last_run(&app.id, outcome.status, outcome.error.as_deref())
            .await
        {
            warn!("Could not update last run of app '{}': {}", app.id, e);
        }

        if outcome.status == RunStatus::Error && !cancelled {
            self.check_auto_pause(&app.id).await;
        }

        if outcome.status == RunStatus::Ok && app.spec.output.notify_on_complete {
            self.notifier.notify_user(
                &app.id,
                format!("{} finished", app.name),
                summarize(&outcome.final_text, "Run completed"),
            );
        }

        RunResult {
            run_id,
            app_id: app.id.clone(),
            session_key,
            status: outcome.status,
            final_text: outcome.final_text,
            duration_ms,
            tokens_used: outcome.tokens_used,
            error_message: outcome.error,
        }
    }

    /// Write one fallback entry when the agent reported nothing.
    async fn ensure_timeline_entry(&self, reporter: &RunReporter, outcome: &Normalized) {
        match self.store.count_entries_for_run(reporter.run_id()).await {
            Ok(0) => {}
            Ok(_) => return,
            Err(e) => {
                warn!("Entry count for run {} failed: {}", reporter.run_id(), e);
                return;
            }
        }
        let written = match outcome.status {
            RunStatus::Skipped => {
                reporter
                    .skipped(summarize(&outcome.final_text, "Nothing to do this time"))
                    .await
            }
            RunStatus::Error => {
                reporter
                    .error(
                        "Run failed",
                        outcome.error.clone().unwrap_or_else(|| "unknown error".to_string()),
                    )
                    .await
            }
            RunStatus::Ok | RunStatus::WaitingUser | RunStatus::Running => {
                reporter
                    .complete(summarize(&outcome.final_text, "Run completed"))
                    .await
            }
        };
        if let Err(e) = written {
            warn!("Fallback entry for run {} failed: {}", reporter.run_id(), e);
        }
    }
}
