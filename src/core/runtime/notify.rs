use tokio::sync::broadcast;
use tracing::trace;

use crate::core::activity::{ActivityEntry, UserResponse};

/// Events published to whoever observes the runtime (UI, RPC bridge, tests).
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    AppStatusChanged {
        app_id: String,
    },
    ActivityEntryAdded {
        entry: ActivityEntry,
    },
    EscalationResolved {
        app_id: String,
        entry_id: String,
        response: UserResponse,
    },
    /// User-facing notification (completion, auto-pause, escalation timeout).
    Notification {
        app_id: String,
        title: String,
        body: String,
    },
}

/// Non-blocking fan-out of [`RuntimeEvent`]s.
///
/// Delivery is best-effort: publishing never waits, never fails, and a
/// receiver that lags simply misses the oldest events. Nothing a run does
/// depends on anyone listening.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: RuntimeEvent) {
        if self.tx.send(event).is_err() {
            trace!("Runtime event dropped: no subscribers");
        }
    }

    pub fn status_changed(&self, app_id: &str) {
        self.publish(RuntimeEvent::AppStatusChanged {
            app_id: app_id.to_string(),
        });
    }

    pub fn entry_added(&self, entry: &ActivityEntry) {
        self.publish(RuntimeEvent::ActivityEntryAdded {
            entry: entry.clone(),
        });
    }

    pub fn escalation_resolved(&self, app_id: &str, entry_id: &str, response: &UserResponse) {
        self.publish(RuntimeEvent::EscalationResolved {
            app_id: app_id.to_string(),
            entry_id: entry_id.to_string(),
            response: response.clone(),
        });
    }

    pub fn notify_user(&self, app_id: &str, title: impl Into<String>, body: impl Into<String>) {
        self.publish(RuntimeEvent::Notification {
            app_id: app_id.to_string(),
            title: title.into(),
            body: body.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_silent() {
        let notifier = Notifier::new(4);
        notifier.status_changed("a");
        notifier.notify_user("a", "t", "b");
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let notifier = Notifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.status_changed("a");
        notifier.notify_user("a", "Done", "All good");
        assert_eq!(
            rx.recv().await.unwrap(),
            RuntimeEvent::AppStatusChanged { app_id: "a".into() }
        );
        assert!(matches!(rx.recv().await.unwrap(), RuntimeEvent::Notification { title, .. } if title == "Done"));
    }
}
