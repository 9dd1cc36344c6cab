use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};

use crate::core::activity::RunStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    Every { interval_ms: u64 },
    Cron { expr: String },
}

impl Schedule {
    /// Human-readable cadence, e.g. `every 30 minutes` or `cron "0 0 9 * * *"`.
    pub fn describe(&self) -> String {
        match self {
            Schedule::Every { interval_ms } => format!("every {}", describe_interval(*interval_ms)),
            Schedule::Cron { expr } => format!("cron \"{}\"", expr),
        }
    }
}

fn describe_interval(ms: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (24 * 60 * 60 * 1000, "day"),
        (60 * 60 * 1000, "hour"),
        (60 * 1000, "minute"),
        (1000, "second"),
    ];
    for (size, name) in UNITS {
        if ms >= size && ms % size == 0 {
            let n = ms / size;
            return if n == 1 {
                format!("1 {}", name)
            } else {
                format!("{} {}s", n, name)
            };
        }
    }
    format!("{} ms", ms)
}

/// Parse `30m`, `1h30m`, `45s`, `2d`, optionally prefixed with `every`.
pub fn parse_interval(text: &str) -> Result<Duration, String> {
    let trimmed = text.trim();
    let body = trimmed.strip_prefix("every").unwrap_or(trimmed).trim();
    if body.is_empty() {
        return Err("empty interval".to_string());
    }
    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    for ch in body.chars().filter(|c| !c.is_whitespace()) {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let unit_ms = match ch {
            's' => 1000,
            'm' => 60 * 1000,
            'h' => 60 * 60 * 1000,
            'd' => 24 * 60 * 60 * 1000,
            other => return Err(format!("unknown interval unit '{}' in '{}'", other, text)),
        };
        let n: u64 = digits
            .parse()
            .map_err(|_| format!("missing number before '{}' in '{}'", ch, text))?;
        total_ms = total_ms.saturating_add(n.saturating_mul(unit_ms));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("interval '{}' is missing a unit", text));
    }
    if total_ms == 0 {
        return Err(format!("interval '{}' must be positive", text));
    }
    Ok(Duration::from_millis(total_ms))
}

/// Typed metadata carried by a scheduler job so a due signal resolves its
/// owner without string parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    AppSubscription {
        app_id: String,
        subscription_index: usize,
    },
}

impl JobPayload {
    pub fn app_id(&self) -> &str {
        match self {
            JobPayload::AppSubscription { app_id, .. } => app_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub schedule: Schedule,
    pub payload: JobPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: String,
    pub schedule: Schedule,
    pub next_run_at_ms: Option<i64>,
}

/// What the runtime did with a due signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DueOutcome {
    Completed(RunStatus),
    Skipped(String),
}

#[async_trait]
pub trait JobDueHandler: Send + Sync {
    /// Must not fail: anything that goes wrong is folded into the outcome.
    async fn job_due(&self, job: JobDescriptor) -> DueOutcome;
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Register a job, replacing any job with the same id.
    async fn add_job(&self, job: JobDescriptor) -> Result<()>;
    async fn remove_job(&self, id: &str) -> Result<bool>;
    /// Re-arm an existing job without resetting its definition.
    async fn resume_job(&self, id: &str) -> Result<bool>;
    async fn get_job(&self, id: &str) -> Result<Option<JobInfo>>;
    fn on_job_due(&self, handler: Arc<dyn JobDueHandler>);
}

type SharedHandler = Arc<RwLock<Option<Arc<dyn JobDueHandler>>>>;

struct CronEntry {
    descriptor: JobDescriptor,
    /// `None` while paused.
    live: Option<uuid::Uuid>,
}

/// [`Scheduler`] backed by `tokio-cron-scheduler`.
#[derive(Clone)]
pub struct CronScheduler {
    scheduler: JobScheduler,
    jobs: Arc<Mutex<HashMap<String, CronEntry>>>,
    handler: SharedHandler,
}

impl CronScheduler {
    pub async fn new() -> Result<Self> {
        Ok(Self {
            scheduler: JobScheduler::new().await?,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            handler: Arc::new(RwLock::new(None)),
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Stop firing a job but keep its definition so `resume_job` can re-arm it.
    pub async fn pause_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if let Some(uuid) = entry.live.take() {
            self.scheduler.remove(&uuid).await?;
        }
        Ok(true)
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    fn build_job(&self, descriptor: &JobDescriptor) -> Result<Job> {
        let handler = self.handler.clone();
        let job_for_tick = descriptor.clone();
        let on_tick = move |_uuid: uuid::Uuid,
                            _l: JobScheduler|
              -> Pin<Box<dyn Future<Output = ()> + Send>> {
            let handler = handler.read().ok().and_then(|h| h.clone());
            let job = job_for_tick.clone();
            Box::pin(async move {
                match handler {
                    Some(handler) => {
                        let id = job.id.clone();
                        let outcome = handler.job_due(job).await;
                        debug!("Scheduler job '{}' handled: {:?}", id, outcome);
                    }
                    None => warn!("Scheduler job '{}' fired with no due handler", job.id),
                }
            })
        };
        let job = match &descriptor.schedule {
            Schedule::Cron { expr } => Job::new_async(expr.as_str(), on_tick),
            Schedule::Every { interval_ms } => {
                Job::new_repeated_async(Duration::from_millis(*interval_ms), on_tick)
            }
        };
        job.map_err(|e| anyhow!("invalid schedule for job '{}': {}", descriptor.id, e))
    }
}

#[async_trait]
impl Scheduler for CronScheduler {
    async fn add_job(&self, job: JobDescriptor) -> Result<()> {
        let built = self.build_job(&job)?;
        let mut jobs = self.jobs.lock().await;
        if let Some(old) = jobs.remove(&job.id)
            && let Some(uuid) = old.live
            && let Err(e) = self.scheduler.remove(&uuid).await
        {
            warn!("Failed to remove previous runtime job '{}': {}", job.id, e);
        }
        let uuid = self.scheduler.add(built).await?;
        info!("Scheduled job '{}' ({})", job.id, job.schedule.describe());
        jobs.insert(
            job.id.clone(),
            CronEntry {
                descriptor: job,
                live: Some(uuid),
            },
        );
        Ok(())
    }

    async fn remove_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.remove(id) else {
            return Ok(false);
        };
        if let Some(uuid) = entry.live {
            self.scheduler.remove(&uuid).await?;
        }
        Ok(true)
    }

    async fn resume_job(&self, id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let Some(entry) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if entry.live.is_none() {
            let built = self.build_job(&entry.descriptor)?;
            entry.live = Some(self.scheduler.add(built).await?);
        }
        Ok(true)
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobInfo>> {
        let (schedule, live) = {
            let jobs = self.jobs.lock().await;
            match jobs.get(id) {
                Some(entry) => (entry.descriptor.schedule.clone(), entry.live),
                None => return Ok(None),
            }
        };
        let next_run_at_ms = match live {
            Some(uuid) => {
                let mut scheduler = self.scheduler.clone();
                scheduler
                    .next_tick_for_job(uuid)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| t.timestamp_millis())
            }
            None => None,
        };
        Ok(Some(JobInfo {
            id: id.to_string(),
            schedule,
            next_run_at_ms,
        }))
    }

    fn on_job_due(&self, handler: Arc<dyn JobDueHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }
}
