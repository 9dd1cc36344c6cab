use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::semaphore::PendingGuard;
use super::trigger::TriggerContext;
use super::{RunTicket, RuntimeInner};
use crate::core::apps::{AppRecord, AppStatus, StatusExtra};
use crate::core::collab::{BusEvent, DueOutcome, JobDescriptor, JobDueHandler};
use crate::error::{RuntimeError, RuntimeResult};

/// Scheduler callback. Holds the runtime weakly so a dropped runtime does
/// not stay alive through the scheduler.
pub(crate) struct DueSignalHandler {
    runtime: Weak<RuntimeInner>,
}

impl DueSignalHandler {
    pub(crate) fn new(runtime: Weak<RuntimeInner>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl JobDueHandler for DueSignalHandler {
    async fn job_due(&self, job: JobDescriptor) -> DueOutcome {
        let Some(inner) = self.runtime.upgrade() else {
            return DueOutcome::Skipped("runtime is gone".to_string());
        };
        inner.handle_job_due(job).await
    }
}

impl RuntimeInner {
    /// Load the app behind a scheduler or bus signal, or say why it should
    /// not run.
    async fn runnable_for_signal(&self, app_id: &str) -> Result<AppRecord, String> {
        if !self.is_activated(app_id).await {
            return Err(format!("app '{}' is not active", app_id));
        }
        let app = match self.registry.get_app(app_id).await {
            Ok(Some(app)) => app,
            Ok(None) => return Err(format!("app '{}' is not installed", app_id)),
            Err(e) => return Err(format!("could not load app '{}': {}", app_id, e)),
        };
        if app.status != AppStatus::Active {
            return Err(format!("app '{}' is {}", app_id, app.status));
        }
        Ok(app)
    }

    async fn run_signal(
        &self,
        app: AppRecord,
        trigger: TriggerContext,
        pending: PendingGuard,
    ) -> DueOutcome {
        match self.execute_with_concurrency(app, trigger, pending).await {
            Ok(result) => DueOutcome::Completed(result.status),
            Err(e) => DueOutcome::Skipped(e.to_string()),
        }
    }

    pub(crate) async fn handle_job_due(&self, job: JobDescriptor) -> DueOutcome {
        let app_id = job.payload.app_id().to_string();
        let app = match self.runnable_for_signal(&app_id).await {
            Ok(app) => app,
            Err(reason) => {
                debug!("Job '{}' skipped: {}", job.id, reason);
                return DueOutcome::Skipped(reason);
            }
        };
        let Some(pending) = self.pending.try_enter_exclusive(&app_id) else {
            info!("Job '{}' skipped: app '{}' already running or queued", job.id, app_id);
            return DueOutcome::Skipped("already running or queued".to_string());
        };
        let trigger = TriggerContext::schedule(&job, Utc::now());
        self.run_signal(app, trigger, pending).await
    }

    pub(crate) async fn handle_event(
        &self,
        app_id: &str,
        index: usize,
        source: &str,
        event: BusEvent,
    ) -> DueOutcome {
        let app = match self.runnable_for_signal(app_id).await {
            Ok(app) => app,
            Err(reason) => {
                debug!("Event {} for app '{}' skipped: {}", event.id, app_id, reason);
                return DueOutcome::Skipped(reason);
            }
        };
        let Some(pending) = self.pending.try_enter_exclusive(app_id) else {
            info!(
                "Event {} (subscription {}) skipped: app '{}' already running or queued",
                event.event_type, index, app_id
            );
            return DueOutcome::Skipped("already running or queued".to_string());
        };
        let trigger = TriggerContext::event(&event, source, Utc::now());
        self.run_signal(app, trigger, pending).await
    }

    /// Start a user-requested run. An app in `error` counts as runnable:
    /// triggering it is a resume.
    pub(crate) async fn trigger_manually(self: &Arc<Self>, app_id: &str) -> RuntimeResult<RunTicket> {
        let mut app = self
            .registry
            .get_app(app_id)
            .await?
            .ok_or_else(|| RuntimeError::AppNotFound(app_id.to_string()))?;
        let runnable = app.is_automation() && matches!(app.status, AppStatus::Active | AppStatus::Error);
        if !runnable {
            return Err(RuntimeError::AppNotRunnable {
                app_id: app_id.to_string(),
                status: app.status,
            });
        }
        if self.semaphore.is_closed() {
            return Err(RuntimeError::ShuttingDown(
                "automation runtime stopped".to_string(),
            ));
        }
        let pending = self
            .pending
            .try_enter_exclusive(app_id)
            .ok_or_else(|| RuntimeError::ConcurrencyLimit(app_id.to_string()))?;

        if app.status == AppStatus::Error {
            info!("Resuming app '{}' from error via manual trigger", app_id);
            self.registry
                .update_status(app_id, AppStatus::Active, StatusExtra::default())
                .await?;
            app.status = AppStatus::Active;
            app.error_message = None;
            if let Err(e) = self.activate(app_id).await {
                warn!("App '{}' resumed without live subscriptions: {}", app_id, e);
            }
        }

        info!("Manual run of app '{}' requested", app_id);
        Ok(self.spawn_run(app, TriggerContext::manual(Utc::now()), pending))
    }

    pub(crate) fn spawn_run(
        self: &Arc<Self>,
        app: AppRecord,
        trigger: TriggerContext,
        pending: PendingGuard,
    ) -> RunTicket {
        let inner = self.clone();
        let app_id = app.id.clone();
        let handle =
            tokio::spawn(async move { inner.execute_with_concurrency(app, trigger, pending).await });
        RunTicket { app_id, handle }
    }
}
