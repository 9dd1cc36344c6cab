//! The automation runtime.
//!
//! Turns declarative app subscriptions into live scheduler jobs and bus
//! subscriptions, gates every run behind one global semaphore, drives runs
//! through the agent, and keeps the escalation and auto-pause state machine
//! moving. All state lives in [`AppRuntime`]; independent instances share
//! nothing.

pub mod activation;
mod escalation;
pub mod executor;
mod guard;
mod maintenance;
pub mod notify;
pub mod reporter;
pub mod semaphore;
mod signals;
pub mod state;
pub mod trigger;

#[cfg(test)]
mod tests;

pub use activation::ActivationState;
pub use escalation::EscalationAnswer;
pub use executor::{ExecutionKey, InFlightRegistry, RunResult};
pub use guard::leading_errors;
pub use notify::{Notifier, RuntimeEvent};
pub use reporter::RunReporter;
pub use state::{AppRunState, AppStateView};
pub use trigger::{TriggerContext, TriggerPayload};

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::core::activity::{ActivityEntry, ActivityStore, AutomationRun, now_ms};
use crate::core::apps::{AppFilter, AppRegistry, AppStatus};
use crate::core::collab::{AgentExecutor, EventBus, KeepAlive, Scheduler};
use crate::core::lifecycle::LifecycleComponent;
use crate::error::{RuntimeError, RuntimeResult};
use maintenance::Background;
use semaphore::{ConcurrencySemaphore, PendingTriggers};
use signals::DueSignalHandler;

const NOTIFY_CAPACITY: usize = 1024;

/// Collaborators the runtime drives. Everything is injected so tests can
/// swap in mocks.
#[derive(Clone)]
pub struct RuntimeDeps {
    pub registry: Arc<dyn AppRegistry>,
    pub scheduler: Arc<dyn Scheduler>,
    pub bus: Arc<dyn EventBus>,
    pub keep_alive: Arc<dyn KeepAlive>,
    pub agent: Arc<dyn AgentExecutor>,
    pub store: ActivityStore,
}

pub(crate) struct RuntimeInner {
    registry: Arc<dyn AppRegistry>,
    scheduler: Arc<dyn Scheduler>,
    bus: Arc<dyn EventBus>,
    keep_alive: Arc<dyn KeepAlive>,
    agent: Arc<dyn AgentExecutor>,
    store: ActivityStore,
    config: RuntimeConfig,
    semaphore: ConcurrencySemaphore,
    pending: PendingTriggers,
    in_flight: Arc<InFlightRegistry>,
    activations: Mutex<HashMap<String, ActivationState>>,
    /// Serializes escalation resolves with the `waiting_user` transition.
    escalation_gate: Mutex<()>,
    notifier: Notifier,
    background: StdMutex<Option<Background>>,
}

/// Handle to a run started in the background.
#[derive(Debug)]
pub struct RunTicket {
    app_id: String,
    handle: JoinHandle<RuntimeResult<RunResult>>,
}

impl RunTicket {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the run. Errors are queueing failures (e.g. shutdown);
    /// a failed run still comes back as `Ok` with an `error` status.
    pub async fn wait(self) -> RuntimeResult<RunResult> {
        self.handle
            .await
            .map_err(|e| RuntimeError::Internal(anyhow::anyhow!("run task failed: {}", e)))?
    }
}

/// What `sync_app_schedule` changed, by job id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

#[derive(Clone)]
pub struct AppRuntime {
    inner: Arc<RuntimeInner>,
}

impl AppRuntime {
    pub fn new(deps: RuntimeDeps, config: RuntimeConfig) -> Self {
        let inner = Arc::new(RuntimeInner {
            registry: deps.registry,
            scheduler: deps.scheduler,
            bus: deps.bus,
            keep_alive: deps.keep_alive,
            agent: deps.agent,
            store: deps.store,
            semaphore: ConcurrencySemaphore::new(config.max_concurrent_runs),
            config,
            pending: PendingTriggers::new(),
            in_flight: Arc::new(InFlightRegistry::default()),
            activations: Mutex::new(HashMap::new()),
            escalation_gate: Mutex::new(()),
            notifier: Notifier::new(NOTIFY_CAPACITY),
            background: StdMutex::new(None),
        });
        inner
            .scheduler
            .on_job_due(Arc::new(DueSignalHandler::new(Arc::downgrade(&inner))));
        Self { inner }
    }

    /// Register an app's subscriptions. No-op if already active.
    pub async fn activate(&self, app_id: &str) -> RuntimeResult<()> {
        self.inner.activate(app_id).await
    }

    /// Tear down an app's registrations and cancel its runs. Safe on apps
    /// that were never activated.
    pub async fn deactivate(&self, app_id: &str) {
        self.inner.deactivate(app_id).await
    }

    pub async fn sync_app_schedule(&self, app_id: &str) -> RuntimeResult<SyncReport> {
        self.inner.sync_app_schedule(app_id).await
    }

    pub async fn trigger_manually(&self, app_id: &str) -> RuntimeResult<RunTicket> {
        self.inner.trigger_manually(app_id).await
    }

    pub async fn respond_to_escalation(
        &self,
        app_id: &str,
        entry_id: &str,
        answer: EscalationAnswer,
    ) -> RuntimeResult<RunTicket> {
        self.inner
            .respond_to_escalation(app_id, entry_id, answer)
            .await
    }

    pub async fn get_app_state(&self, app_id: &str) -> RuntimeResult<AppStateView> {
        self.inner.get_app_state(app_id).await
    }

    pub async fn get_activity_entries(
        &self,
        app_id: &str,
        limit: usize,
    ) -> RuntimeResult<Vec<ActivityEntry>> {
        Ok(self.inner.store.entries_for_app(app_id, limit).await?)
    }

    pub async fn get_run(&self, run_id: &str) -> RuntimeResult<Option<AutomationRun>> {
        Ok(self.inner.store.get_run(run_id).await?)
    }

    pub async fn get_runs_for_app(
        &self,
        app_id: &str,
        limit: usize,
    ) -> RuntimeResult<Vec<AutomationRun>> {
        Ok(self.inner.store.runs_for_app(app_id, limit).await?)
    }

    /// Process startup: recover interrupted runs, start background tasks,
    /// and activate every app whose stored status wants it. Returns how
    /// many apps ended up active.
    pub async fn activate_all(&self) -> RuntimeResult<usize> {
        let inner = &self.inner;
        inner.semaphore.reopen();

        let interrupted = inner.store.mark_interrupted_runs(now_ms()).await?;
        if interrupted > 0 {
            warn!("Marked {} interrupted run(s) as failed", interrupted);
        }

        inner.start_background();

        let apps = inner
            .registry
            .list_apps(&AppFilter::automations_in(&[
                AppStatus::Active,
                AppStatus::WaitingUser,
            ]))
            .await?;
        for app in &apps {
            if let Err(e) = inner.activate(&app.id).await {
                warn!("Could not activate app '{}': {}", app.id, e);
            }
        }
        let active = inner.activations.lock().await.len();
        info!("Automation runtime started: {} of {} app(s) active", active, apps.len());
        Ok(active)
    }

    /// Process shutdown: stop background tasks, deactivate everything and
    /// fail queued runs with `ShuttingDown`.
    pub async fn deactivate_all(&self) {
        let inner = &self.inner;
        inner.stop_background().await;
        let ids: Vec<String> = inner.activations.lock().await.keys().cloned().collect();
        for id in &ids {
            inner.deactivate(id).await;
        }
        let cancelled = inner.in_flight.cancel_all();
        inner.semaphore.reject_all("automation runtime stopped");
        info!(
            "Automation runtime stopped: {} app(s) deactivated, {} run(s) cancelled",
            ids.len(),
            cancelled
        );
    }

    /// Time out stale escalations now instead of waiting for the sweep.
    /// Returns the ids of entries that timed out.
    pub async fn sweep_escalations(&self) -> RuntimeResult<Vec<String>> {
        self.inner.sweep_escalation_timeouts(now_ms()).await
    }

    /// Delete runs older than the retention window. Zero when disabled.
    pub async fn prune_history(&self) -> RuntimeResult<usize> {
        self.inner.prune_history(now_ms()).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.notifier.subscribe()
    }

    pub async fn is_active(&self, app_id: &str) -> bool {
        self.inner.is_activated(app_id).await
    }

    pub async fn active_app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.activations.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn running_count(&self) -> usize {
        self.inner.in_flight.total()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }
}

#[async_trait]
impl LifecycleComponent for AppRuntime {
    async fn on_start(&mut self) -> Result<()> {
        self.activate_all().await?;
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.deactivate_all().await;
        Ok(())
    }
}
