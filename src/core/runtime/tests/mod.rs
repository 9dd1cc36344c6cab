//! Orchestrator tests against an in-memory database, a hand-driven
//! scheduler and a scripted agent.

mod activation;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{AppRuntime, RuntimeDeps};
use crate::config::RuntimeConfig;
use crate::core::activity::{ActivityEntry, ActivityStore, AutomationRun};
use crate::core::apps::{
    AppRecord, AppRegistry, AppSpec, AppStatus, SqliteAppRegistry, Subscription,
    SubscriptionSource,
};
use crate::core::collab::{
    AgentExecutor, DueOutcome, ExecutionRequest, ExecutionResult, JobDescriptor, JobDueHandler,
    JobInfo, KeepAliveRegistry, LocalEventBus, Schedule, Scheduler,
};
use crate::core::db;

/// Scheduler whose jobs only fire when a test says so.
#[derive(Default)]
pub struct MockScheduler {
    jobs: Mutex<HashMap<String, JobDescriptor>>,
    handler: Mutex<Option<Arc<dyn JobDueHandler>>>,
    adds: Mutex<Vec<String>>,
    resumes: Mutex<Vec<String>>,
    refused: Mutex<Vec<String>>,
}

impl MockScheduler {
    pub fn job_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.jobs.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn job(&self, id: &str) -> Option<JobDescriptor> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    pub fn add_count(&self, id: &str) -> usize {
        self.adds.lock().unwrap().iter().filter(|j| *j == id).count()
    }

    pub fn resume_count(&self, id: &str) -> usize {
        self.resumes.lock().unwrap().iter().filter(|j| *j == id).count()
    }

    /// Make every later `add_job` for this id fail.
    pub fn refuse(&self, id: &str) {
        self.refused.lock().unwrap().push(id.to_string());
    }

    /// Pretend a job survived from an earlier activation.
    pub fn seed(&self, job: JobDescriptor) {
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
    }

    pub async fn fire(&self, id: &str) -> DueOutcome {
        let job = self.job(id).expect("job registered");
        let handler = self.handler.lock().unwrap().clone().expect("due handler set");
        handler.job_due(job).await
    }
}

#[async_trait]
impl Scheduler for MockScheduler {
    async fn add_job(&self, job: JobDescriptor) -> Result<()> {
        if self.refused.lock().unwrap().contains(&job.id) {
            anyhow::bail!("scheduler refused job '{}'", job.id);
        }
        self.adds.lock().unwrap().push(job.id.clone());
        self.jobs.lock().unwrap().insert(job.id.clone(), job);
        Ok(())
    }

    async fn remove_job(&self, id: &str) -> Result<bool> {
        Ok(self.jobs.lock().unwrap().remove(id).is_some())
    }

    async fn resume_job(&self, id: &str) -> Result<bool> {
        let known = self.jobs.lock().unwrap().contains_key(id);
        if known {
            self.resumes.lock().unwrap().push(id.to_string());
        }
        Ok(known)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobInfo>> {
        Ok(self.job(id).map(|job| JobInfo {
            id: job.id.clone(),
            next_run_at_ms: Some(match &job.schedule {
                Schedule::Every { interval_ms } => 1_000_000 + *interval_ms as i64,
                Schedule::Cron { .. } => 1_000_000,
            }),
            schedule: job.schedule,
        }))
    }

    fn on_job_due(&self, handler: Arc<dyn JobDueHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }
}

/// What the scripted agent does on one call.
#[derive(Clone)]
pub enum Step {
    Succeed(&'static str),
    Fail(&'static str),
    Throw(&'static str),
    Skip,
    /// Report a milestone, then succeed.
    Report(&'static str),
    Escalate(&'static str, Vec<&'static str>),
    /// Claim to wait for the user without asking anything.
    WaitWithoutEscalation,
    /// Wait for a permit on the gate, then succeed.
    Gated(Arc<tokio::sync::Semaphore>),
    /// Never finish unless cancelled.
    Hang,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockAgent {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<ExecutionRequest>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAgent {
    pub fn new(fallback: Step) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, steps: Vec<Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentExecutor for MockAgent {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.calls.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _active = ActiveGuard(&self.active);

        match step {
            Step::Succeed(text) => Ok(ExecutionResult::ok(text).with_tokens(10)),
            Step::Fail(message) => Ok(ExecutionResult::error(message)),
            Step::Throw(message) => Err(anyhow::anyhow!(message)),
            Step::Skip => Ok(ExecutionResult::skipped("")),
            Step::Report(summary) => {
                request.reporter.milestone(summary).await?;
                Ok(ExecutionResult::ok("reported"))
            }
            Step::Escalate(question, choices) => {
                request
                    .reporter
                    .escalate(question, Some(choices.iter().map(|c| c.to_string()).collect()))
                    .await?;
                Ok(ExecutionResult::waiting_for_user("asked the user"))
            }
            Step::WaitWithoutEscalation => Ok(ExecutionResult::waiting_for_user("hmm")),
            Step::Gated(gate) => {
                gate.acquire().await?.forget();
                Ok(ExecutionResult::ok("gated run done"))
            }
            Step::Hang => {
                std::future::pending::<()>().await;
                Ok(ExecutionResult::ok("unreachable"))
            }
        }
    }
}

pub struct Harness {
    pub runtime: AppRuntime,
    pub registry: SqliteAppRegistry,
    pub store: ActivityStore,
    pub scheduler: Arc<MockScheduler>,
    pub bus: LocalEventBus,
    pub keep_alive: KeepAliveRegistry,
    pub agent: Arc<MockAgent>,
}

pub fn test_config(max_concurrent_runs: usize) -> RuntimeConfig {
    RuntimeConfig {
        max_concurrent_runs,
        escalation_timeout_secs: 60,
        escalation_sweep_interval_secs: 3600,
        ..RuntimeConfig::default()
    }
}

pub async fn harness_with(config: RuntimeConfig, fallback: Step) -> Harness {
    let shared = db::open_in_memory().unwrap();
    let registry = SqliteAppRegistry::new(shared.clone());
    let store = ActivityStore::new(shared);
    let scheduler = Arc::new(MockScheduler::default());
    let bus = LocalEventBus::new();
    let keep_alive = KeepAliveRegistry::new();
    let agent = Arc::new(MockAgent::new(fallback));
    let runtime = AppRuntime::new(
        RuntimeDeps {
            registry: Arc::new(registry.clone()),
            scheduler: scheduler.clone(),
            bus: Arc::new(bus.clone()),
            keep_alive: Arc::new(keep_alive.clone()),
            agent: agent.clone(),
            store: store.clone(),
        },
        config,
    );
    Harness {
        runtime,
        registry,
        store,
        scheduler,
        bus,
        keep_alive,
        agent,
    }
}

pub async fn harness() -> Harness {
    harness_with(test_config(2), Step::Succeed("done")).await
}

impl Harness {
    /// The harness collaborators, for building a runtime with one of them
    /// swapped out.
    pub fn deps(&self) -> RuntimeDeps {
        RuntimeDeps {
            registry: Arc::new(self.registry.clone()),
            scheduler: self.scheduler.clone(),
            bus: Arc::new(self.bus.clone()),
            keep_alive: Arc::new(self.keep_alive.clone()),
            agent: self.agent.clone(),
            store: self.store.clone(),
        }
    }

    pub async fn install(&self, app: &AppRecord) {
        self.registry.install_app(app).await.unwrap();
    }

    pub async fn status(&self, app_id: &str) -> AppStatus {
        self.registry.get_app(app_id).await.unwrap().unwrap().status
    }

    pub async fn runs(&self, app_id: &str) -> Vec<AutomationRun> {
        self.store.runs_for_app(app_id, 100).await.unwrap()
    }

    pub async fn entries(&self, app_id: &str) -> Vec<ActivityEntry> {
        self.store.entries_for_app(app_id, 100).await.unwrap()
    }
}

pub fn app(id: &str, status: AppStatus, sources: Vec<SubscriptionSource>) -> AppRecord {
    let mut app = AppRecord::automation(
        id,
        &format!("{} app", id),
        AppSpec {
            system_prompt: format!("You are the {} automation.", id),
            subscriptions: sources
                .into_iter()
                .map(|source| Subscription {
                    source,
                    filter: Vec::new(),
                })
                .collect(),
            ..AppSpec::default()
        },
    );
    app.status = status;
    app
}

pub fn every(interval: &str) -> SubscriptionSource {
    SubscriptionSource::Schedule {
        every: Some(interval.to_string()),
        cron: None,
    }
}

pub fn webhook(hook: &str) -> SubscriptionSource {
    SubscriptionSource::Webhook {
        hook: hook.to_string(),
    }
}

/// Poll until `check` holds, failing the test after a few seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
