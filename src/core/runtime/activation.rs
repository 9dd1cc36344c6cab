use regex::escape;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{RuntimeInner, SyncReport};
use crate::core::apps::{AppRecord, Subscription, SubscriptionSource};
use crate::core::collab::scheduler::parse_interval;
use crate::core::collab::{
    BusEvent, EventFilter, EventHandler, JobDescriptor, JobPayload, KeepAliveGuard, MatchRule,
    Schedule, Unsubscribe, handler_fn,
};
use crate::error::{RuntimeError, RuntimeResult};

/// Live registrations owned by one activated app. In memory only; rebuilt
/// from the registry's active set after a restart.
#[derive(Debug, Default)]
pub struct ActivationState {
    pub job_ids: Vec<String>,
    pub subscriptions: Vec<Unsubscribe>,
    pub keep_alive: Option<KeepAliveGuard>,
}

impl ActivationState {
    pub fn registration_count(&self) -> usize {
        self.job_ids.len() + self.subscriptions.len()
    }
}

/// What one subscription turns into.
#[derive(Debug, Clone, PartialEq)]
pub enum Registration {
    Job(JobDescriptor),
    Event {
        index: usize,
        source: &'static str,
        filter: EventFilter,
    },
}

pub fn job_id(app_id: &str, index: usize) -> String {
    format!("{}:sub-{}", app_id, index)
}

pub fn keep_alive_key(app_id: &str) -> String {
    format!("automation-app:{}", app_id)
}

/// The scheduler wants a leading seconds field; classic five-field
/// expressions fire at second zero.
pub fn normalize_cron(cron: &str) -> Result<String, String> {
    let fields: Vec<&str> = cron.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(format!(
            "cron expression '{}' has {} fields, expected 5 or 6",
            cron.trim(),
            n
        )),
    }
}

pub fn schedule_for(every: Option<&str>, cron: Option<&str>) -> Result<Schedule, String> {
    match (every, cron) {
        (Some(every), None) => {
            let interval = parse_interval(every)?;
            Ok(Schedule::Every {
                interval_ms: interval.as_millis() as u64,
            })
        }
        (None, Some(cron)) => Ok(Schedule::Cron {
            expr: normalize_cron(cron)?,
        }),
        (Some(_), Some(_)) => Err("schedule sets both 'every' and 'cron'".to_string()),
        (None, None) => Err("schedule sets neither 'every' nor 'cron'".to_string()),
    }
}

/// Typed bus filter for an event-sourced subscription, with its own extra
/// rules appended after the source's rule.
pub fn filter_for(subscription: &Subscription) -> Result<EventFilter, String> {
    let mut filter = match &subscription.source {
        SubscriptionSource::Schedule { .. } => {
            return Err("schedule subscriptions have no event filter".to_string());
        }
        SubscriptionSource::File { path, events } => {
            let event_type = match events.as_slice() {
                [single] => format!("file.{}", single),
                _ => "file.*".to_string(),
            };
            let mut filter = EventFilter::new(event_type).with_rule(MatchRule::Contains {
                path: "path".to_string(),
                value: path.clone(),
            });
            if events.len() > 1 {
                let alternatives: Vec<String> = events.iter().map(|e| escape(e)).collect();
                filter = filter.with_rule(MatchRule::Matches {
                    path: "event".to_string(),
                    pattern: format!("^({})$", alternatives.join("|")),
                });
            }
            filter
        }
        SubscriptionSource::Webhook { hook } => {
            EventFilter::new("webhook.received").with_rule(MatchRule::Eq {
                path: "hook".to_string(),
                value: hook.clone().into(),
            })
        }
        SubscriptionSource::Webpage { url } => {
            EventFilter::new("webpage.changed").with_rule(MatchRule::Eq {
                path: "url".to_string(),
                value: url.clone().into(),
            })
        }
        SubscriptionSource::Rss { url } => EventFilter::new("rss.item").with_rule(MatchRule::Eq {
            path: "feed_url".to_string(),
            value: url.clone().into(),
        }),
    };
    for rule in &subscription.filter {
        rule.validate()?;
        filter.rules.push(rule.clone());
    }
    Ok(filter)
}

/// Derive every registration an app needs. Fails on the first
/// subscription that cannot be translated.
pub fn plan_registrations(app: &AppRecord) -> RuntimeResult<Vec<Registration>> {
    if app.spec.subscriptions.is_empty() {
        return Err(RuntimeError::NoSubscriptions(app.id.clone()));
    }
    let invalid = |index: usize, reason: String| RuntimeError::InvalidSubscription {
        app_id: app.id.clone(),
        index,
        reason,
    };
    app.spec
        .subscriptions
        .iter()
        .enumerate()
        .map(|(index, sub)| match &sub.source {
            SubscriptionSource::Schedule { every, cron } => {
                let schedule =
                    schedule_for(every.as_deref(), cron.as_deref()).map_err(|r| invalid(index, r))?;
                Ok(Registration::Job(JobDescriptor {
                    id: job_id(&app.id, index),
                    schedule,
                    payload: JobPayload::AppSubscription {
                        app_id: app.id.clone(),
                        subscription_index: index,
                    },
                }))
            }
            source => Ok(Registration::Event {
                index,
                source: source.label(),
                filter: filter_for(sub).map_err(|r| invalid(index, r))?,
            }),
        })
        .collect()
}

/// Only the job descriptors of a plan.
pub fn planned_jobs(plan: &[Registration]) -> Vec<JobDescriptor> {
    plan.iter()
        .filter_map(|r| match r {
            Registration::Job(job) => Some(job.clone()),
            Registration::Event { .. } => None,
        })
        .collect()
}

impl RuntimeInner {
    pub(crate) async fn is_activated(&self, app_id: &str) -> bool {
        self.activations.lock().await.contains_key(app_id)
    }

    pub(crate) async fn activate(self: &Arc<Self>, app_id: &str) -> RuntimeResult<()> {
        let mut activations = self.activations.lock().await;
        if activations.contains_key(app_id) {
            return Ok(());
        }
        let app = self
            .registry
            .get_app(app_id)
            .await?
            .ok_or_else(|| RuntimeError::AppNotFound(app_id.to_string()))?;
        if !app.is_automation() {
            debug!("App '{}' is not an automation, nothing to activate", app_id);
            return Ok(());
        }
        let plan = plan_registrations(&app)?;

        let mut state = ActivationState::default();
        for registration in plan {
            match registration {
                Registration::Job(job) => {
                    let id = job.id.clone();
                    if let Err(e) = self.register_job(job).await {
                        self.release_state(app_id, state).await;
                        return Err(e.into());
                    }
                    state.job_ids.push(id);
                }
                Registration::Event {
                    index,
                    source,
                    filter,
                } => {
                    debug!(
                        "App '{}' listens for {} ({})",
                        app_id, filter.event_type, source
                    );
                    let handler = self.event_handler(app_id, index, source);
                    state.subscriptions.push(self.bus.on(filter, handler));
                }
            }
        }
        if state.registration_count() > 0 {
            state.keep_alive = Some(
                self.keep_alive
                    .register_keep_alive_reason(&keep_alive_key(app_id)),
            );
        }
        info!(
            "Activated app '{}': {} job(s), {} event subscription(s)",
            app_id,
            state.job_ids.len(),
            state.subscriptions.len()
        );
        activations.insert(app_id.to_string(), state);
        drop(activations);
        self.notifier.status_changed(app_id);
        Ok(())
    }

    /// Add a job, or resume it untouched when an identical one already
    /// exists so its interval anchor is kept.
    async fn register_job(&self, job: JobDescriptor) -> anyhow::Result<()> {
        match self.scheduler.get_job(&job.id).await? {
            Some(existing) if existing.schedule == job.schedule => {
                self.scheduler.resume_job(&job.id).await?;
                debug!("Resumed existing job '{}'", job.id);
            }
            _ => self.scheduler.add_job(job).await?,
        }
        Ok(())
    }

    async fn release_state(&self, app_id: &str, state: ActivationState) -> usize {
        let ActivationState {
            job_ids,
            subscriptions,
            keep_alive,
        } = state;
        for id in &job_ids {
            if let Err(e) = self.scheduler.remove_job(id).await {
                warn!("Could not remove job '{}' of app '{}': {}", id, app_id, e);
            }
        }
        let released = job_ids.len() + subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        if let Some(guard) = keep_alive {
            guard.release();
        }
        released
    }

    fn event_handler(
        self: &Arc<Self>,
        app_id: &str,
        index: usize,
        source: &'static str,
    ) -> EventHandler {
        let runtime = Arc::downgrade(self);
        let app_id = app_id.to_string();
        handler_fn(move |event: BusEvent| {
            let runtime = runtime.clone();
            let app_id = app_id.clone();
            async move {
                let Some(inner) = runtime.upgrade() else {
                    return;
                };
                let outcome = inner.handle_event(&app_id, index, source, event).await;
                debug!("Event for app '{}' handled: {:?}", app_id, outcome);
            }
        })
    }

    pub(crate) async fn deactivate(&self, app_id: &str) {
        let mut activations = self.activations.lock().await;
        let state = activations.remove(app_id);
        let cancelled = self.in_flight.cancel_app(app_id);
        let Some(state) = state else {
            if cancelled > 0 {
                info!("Cancelled {} run(s) of inactive app '{}'", cancelled, app_id);
            }
            return;
        };
        let released = self.release_state(app_id, state).await;
        drop(activations);
        info!(
            "Deactivated app '{}': {} registration(s) released, {} run(s) cancelled",
            app_id, released, cancelled
        );
        self.notifier.status_changed(app_id);
    }

    /// Reconcile an active app's scheduler jobs with its current spec.
    /// Changed schedules are re-added so their anchors reset.
    pub(crate) async fn sync_app_schedule(&self, app_id: &str) -> RuntimeResult<SyncReport> {
        let app = self
            .registry
            .get_app(app_id)
            .await?
            .ok_or_else(|| RuntimeError::AppNotFound(app_id.to_string()))?;
        let desired = match plan_registrations(&app) {
            Ok(plan) => planned_jobs(&plan),
            Err(RuntimeError::NoSubscriptions(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        let mut activations = self.activations.lock().await;
        let Some(state) = activations.get_mut(app_id) else {
            debug!("App '{}' is not active, schedule sync skipped", app_id);
            return Ok(SyncReport::default());
        };

        let mut report = SyncReport::default();
        let mut tracked = state.job_ids.clone();
        let reconciled = self
            .reconcile_jobs(&desired, &mut tracked, &mut report)
            .await;
        // Jobs that reached the scheduler stay owned by the app even when a
        // later step failed, so deactivate still removes them.
        state.job_ids = tracked;

        if state.registration_count() == 0 {
            if let Some(guard) = state.keep_alive.take() {
                guard.release();
            }
        } else if state.keep_alive.is_none() {
            state.keep_alive = Some(
                self.keep_alive
                    .register_keep_alive_reason(&keep_alive_key(app_id)),
            );
        }

        if let Err(e) = reconciled {
            warn!("Schedule sync of app '{}' stopped early: {}", app_id, e);
            return Err(e.into());
        }
        if !report.is_noop() {
            info!(
                "Synced schedule of app '{}': {} added, {} updated, {} removed",
                app_id,
                report.added.len(),
                report.updated.len(),
                report.removed.len()
            );
        }
        Ok(report)
    }

    /// Bring the scheduler in line with `desired`, keeping `tracked` equal
    /// to the app's jobs that exist after each step.
    async fn reconcile_jobs(
        &self,
        desired: &[JobDescriptor],
        tracked: &mut Vec<String>,
        report: &mut SyncReport,
    ) -> anyhow::Result<()> {
        for job in desired {
            match self.scheduler.get_job(&job.id).await? {
                Some(existing) if existing.schedule == job.schedule => {
                    report.unchanged.push(job.id.clone());
                }
                Some(_) => {
                    self.scheduler.remove_job(&job.id).await?;
                    tracked.retain(|id| id != &job.id);
                    self.scheduler.add_job(job.clone()).await?;
                    report.updated.push(job.id.clone());
                }
                None => {
                    self.scheduler.add_job(job.clone()).await?;
                    report.added.push(job.id.clone());
                }
            }
            if !tracked.contains(&job.id) {
                tracked.push(job.id.clone());
            }
        }
        let stale: Vec<String> = tracked
            .iter()
            .filter(|id| !desired.iter().any(|job| &job.id == *id))
            .cloned()
            .collect();
        for id in stale {
            self.scheduler.remove_job(&id).await?;
            tracked.retain(|t| t != &id);
            report.removed.push(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::apps::AppSpec;
    use crate::core::collab::BusEvent;
    use serde_json::json;

    fn app_with(subscriptions: Vec<Subscription>) -> AppRecord {
        AppRecord::automation(
            "A",
            "A",
            AppSpec {
                subscriptions,
                ..AppSpec::default()
            },
        )
    }

    fn sub(source: SubscriptionSource) -> Subscription {
        Subscription {
            source,
            filter: Vec::new(),
        }
    }

    #[test]
    fn schedule_subscription_becomes_job() {
        let app = app_with(vec![sub(SubscriptionSource::Schedule {
            every: Some("30m".into()),
            cron: None,
        })]);
        let plan = plan_registrations(&app).unwrap();
        let jobs = planned_jobs(&plan);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "A:sub-0");
        assert_eq!(jobs[0].schedule, Schedule::Every { interval_ms: 1_800_000 });
        assert_eq!(jobs[0].payload.app_id(), "A");
    }

    #[test]
    fn job_ids_follow_subscription_position() {
        let app = app_with(vec![
            sub(SubscriptionSource::Webhook { hook: "stripe".into() }),
            sub(SubscriptionSource::Schedule {
                every: None,
                cron: Some("0 0 9 * * *".into()),
            }),
        ]);
        let jobs = planned_jobs(&plan_registrations(&app).unwrap());
        assert_eq!(jobs[0].id, "A:sub-1");
    }

    #[test]
    fn empty_or_invalid_subscriptions_are_rejected() {
        assert!(matches!(
            plan_registrations(&app_with(vec![])),
            Err(RuntimeError::NoSubscriptions(_))
        ));
        let both = app_with(vec![sub(SubscriptionSource::Schedule {
            every: Some("1h".into()),
            cron: Some("* * * * *".into()),
        })]);
        assert!(matches!(
            plan_registrations(&both),
            Err(RuntimeError::InvalidSubscription { index: 0, .. })
        ));
        let mut bad_rule = sub(SubscriptionSource::Rss { url: "https://x/feed".into() });
        bad_rule.filter.push(MatchRule::Matches {
            path: "title".into(),
            pattern: "(".into(),
        });
        assert!(plan_registrations(&app_with(vec![bad_rule])).is_err());
    }

    #[test]
    fn event_sources_translate_to_typed_filters() {
        let mut hook = sub(SubscriptionSource::Webhook { hook: "stripe".into() });
        hook.filter.push(MatchRule::Eq {
            path: "kind".into(),
            value: json!("refund"),
        });
        let filter = filter_for(&hook).unwrap();
        assert!(filter.matches(&BusEvent::new(
            "webhook.received",
            json!({ "hook": "stripe", "kind": "refund" })
        )));
        assert!(!filter.matches(&BusEvent::new(
            "webhook.received",
            json!({ "hook": "stripe", "kind": "charge" })
        )));

        let files = filter_for(&sub(SubscriptionSource::File {
            path: "/data/inbox".into(),
            events: vec!["created".into(), "modified".into()],
        }))
        .unwrap();
        assert_eq!(files.event_type, "file.*");
        assert!(files.matches(&BusEvent::new(
            "file.modified",
            json!({ "path": "/data/inbox/a.txt", "event": "modified" })
        )));
        assert!(!files.matches(&BusEvent::new(
            "file.deleted",
            json!({ "path": "/data/inbox/a.txt", "event": "deleted" })
        )));

        let page = filter_for(&sub(SubscriptionSource::Webpage { url: "https://a.b".into() })).unwrap();
        assert_eq!(page.event_type, "webpage.changed");
        let feed = filter_for(&sub(SubscriptionSource::Rss { url: "https://a.b/rss".into() })).unwrap();
        assert!(feed.matches(&BusEvent::new("rss.item", json!({ "feed_url": "https://a.b/rss" }))));
    }

    #[test]
    fn cron_field_count_is_checked() {
        assert_eq!(
            schedule_for(None, Some("0 9 * * *")).unwrap(),
            Schedule::Cron {
                expr: "0 0 9 * * *".into()
            }
        );
        assert_eq!(
            schedule_for(None, Some(" 30  0 9 * * 1-5 ")).unwrap(),
            Schedule::Cron {
                expr: "30 0 9 * * 1-5".into()
            }
        );
        assert!(schedule_for(None, Some("daily")).is_err());
        assert!(schedule_for(None, Some("0 0 9 * * * 2030")).is_err());
    }
}
