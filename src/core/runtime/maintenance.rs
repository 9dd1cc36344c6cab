use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::RuntimeInner;
use crate::core::activity::now_ms;
use crate::core::apps::{AppStatus, AppStatusChange};
use crate::error::RuntimeResult;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Tasks started by `activate_all` and stopped by `deactivate_all`.
pub(crate) struct Background {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RuntimeInner {
    pub(crate) fn start_background(self: &Arc<Self>) {
        let Ok(mut slot) = self.background.lock() else {
            warn!("Background task slot poisoned, not starting maintenance");
            return;
        };
        if slot.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        let tasks = vec![
            self.spawn_status_listener(cancel.clone()),
            self.spawn_maintenance(cancel.clone()),
        ];
        *slot = Some(Background { cancel, tasks });
        debug!("Runtime background tasks started");
    }

    pub(crate) async fn stop_background(&self) {
        let background = match self.background.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(background) = background else {
            return;
        };
        background.cancel.cancel();
        for task in background.tasks {
            if let Err(e) = task.await {
                warn!("Runtime background task ended abnormally: {}", e);
            }
        }
        debug!("Runtime background tasks stopped");
    }

    /// Follow stored status flips: active apps get registrations, apps
    /// leaving the active set lose them.
    fn spawn_status_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut changes = self.registry.on_app_status_change();
        let runtime = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = changes.recv() => received,
                };
                match received {
                    Ok(change) => {
                        let Some(inner) = runtime.upgrade() else {
                            break;
                        };
                        inner.apply_status_change(change).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Status listener lagged, {} change(s) missed", missed)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    pub(crate) async fn apply_status_change(self: &Arc<Self>, change: AppStatusChange) {
        debug!(
            "App '{}' status {:?} -> {}",
            change.app_id, change.previous, change.status
        );
        match change.status {
            AppStatus::Active => {
                if let Err(e) = self.activate(&change.app_id).await {
                    warn!("Could not activate app '{}': {}", change.app_id, e);
                }
            }
            AppStatus::WaitingUser => {}
            AppStatus::Installed | AppStatus::Paused | AppStatus::Error => {
                self.deactivate(&change.app_id).await
            }
        }
        self.notifier.status_changed(&change.app_id);
    }

    /// Escalation sweep on every tick; retention prune at most once a day.
    fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let runtime = Arc::downgrade(self);
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_prune: Option<i64> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = runtime.upgrade() else {
                    break;
                };
                let now = now_ms();
                if let Err(e) = inner.sweep_escalation_timeouts(now).await {
                    warn!("Escalation sweep failed: {}", e);
                }
                if last_prune.is_none_or(|at| now - at >= DAY_MS) {
                    last_prune = Some(now);
                    if let Err(e) = inner.prune_history(now).await {
                        warn!("Retention prune failed: {}", e);
                    }
                }
            }
        })
    }

    pub(crate) async fn prune_history(&self, now: i64) -> RuntimeResult<usize> {
        let Some(retention) = self.config.retention() else {
            return Ok(0);
        };
        let cutoff = now - retention.as_millis() as i64;
        let pruned = self.store.prune_runs_before(cutoff).await?;
        if pruned > 0 {
            info!(
                "Pruned {} run(s) older than {} day(s)",
                pruned, self.config.retention_days
            );
        }
        Ok(pruned)
    }
}
