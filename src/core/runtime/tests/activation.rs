use serde_json::json;

use super::*;
use crate::core::activity::{RunStatus, TriggerType};
use crate::core::apps::AppKind;
use crate::core::collab::{BusEvent, JobPayload};
use crate::core::runtime::EscalationAnswer;
use crate::error::RuntimeError;

#[tokio::test]
async fn activation_registers_one_job_per_schedule_subscription() {
    let h = harness().await;
    h.install(&app("A", AppStatus::Active, vec![every("30m")])).await;

    h.runtime.activate("A").await.unwrap();

    assert_eq!(h.scheduler.job_ids(), vec!["A:sub-0"]);
    assert_eq!(
        h.scheduler.job("A:sub-0").unwrap().schedule,
        Schedule::Every {
            interval_ms: 30 * 60 * 1000
        }
    );
    assert!(h.runtime.is_active("A").await);
    assert_eq!(h.keep_alive.count("automation-app:A"), 1);
}

#[tokio::test]
async fn activation_is_idempotent() {
    let h = harness().await;
    h.install(&app("A", AppStatus::Active, vec![every("30m"), webhook("gh")])).await;

    h.runtime.activate("A").await.unwrap();
    h.runtime.activate("A").await.unwrap();

    assert_eq!(h.scheduler.add_count("A:sub-0"), 1);
    assert_eq!(h.bus.subscriber_count(), 1);
    assert_eq!(h.keep_alive.count("automation-app:A"), 1);
}

#[tokio::test]
async fn activation_rejects_unknown_and_empty_apps() {
    let h = harness().await;
    assert!(matches!(
        h.runtime.activate("ghost").await,
        Err(RuntimeError::AppNotFound(_))
    ));

    h.install(&app("empty", AppStatus::Active, vec![])).await;
    assert!(matches!(
        h.runtime.activate("empty").await,
        Err(RuntimeError::NoSubscriptions(_))
    ));
    assert!(!h.runtime.is_active("empty").await);
    assert!(!h.keep_alive.is_held());

    let mut assistant = app("chat", AppStatus::Active, vec![every("1h")]);
    assistant.kind = AppKind::Assistant;
    h.install(&assistant).await;
    h.runtime.activate("chat").await.unwrap();
    assert!(!h.runtime.is_active("chat").await);
    assert!(h.scheduler.job_ids().is_empty());
}

#[tokio::test]
async fn invalid_subscription_leaves_nothing_behind() {
    let h = harness().await;
    let bad = SubscriptionSource::Schedule {
        every: None,
        cron: Some("not a cron".into()),
    };
    h.install(&app("A", AppStatus::Active, vec![every("1h"), bad])).await;

    let err = h.runtime.activate("A").await.unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidSubscription { index: 1, .. }));
    assert!(h.scheduler.job_ids().is_empty());
    assert!(!h.keep_alive.is_held());
}

#[tokio::test]
async fn surviving_identical_job_is_resumed_not_replaced() {
    let h = harness().await;
    h.install(&app("A", AppStatus::Active, vec![every("30m"), every("2h")])).await;
    let payload = |index| JobPayload::AppSubscription {
        app_id: "A".into(),
        subscription_index: index,
    };
    h.scheduler.seed(JobDescriptor {
        id: "A:sub-0".into(),
        schedule: Schedule::Every {
            interval_ms: 30 * 60 * 1000,
        },
        payload: payload(0),
    });
    h.scheduler.seed(JobDescriptor {
        id: "A:sub-1".into(),
        schedule: Schedule::Every {
            interval_ms: 60 * 60 * 1000,
        },
        payload: payload(1),
    });

    h.runtime.activate("A").await.unwrap();

    assert_eq!(h.scheduler.add_count("A:sub-0"), 0);
    assert_eq!(h.scheduler.resume_count("A:sub-0"), 1);
    // Stale cadence is replaced.
    assert_eq!(h.scheduler.add_count("A:sub-1"), 1);
    assert_eq!(
        h.scheduler.job("A:sub-1").unwrap().schedule,
        Schedule::Every {
            interval_ms: 2 * 60 * 60 * 1000
        }
    );
}

#[tokio::test]
async fn deactivate_without_activation_is_a_noop() {
    let h = harness().await;
    h.install(&app("A", AppStatus::Active, vec![every("1h")])).await;
    h.runtime.deactivate("A").await;
    h.runtime.deactivate("never-installed").await;
    assert!(h.runtime.active_app_ids().await.is_empty());
}

#[tokio::test]
async fn deactivate_releases_everything_and_cancels_every_run() {
    let h = harness_with(test_config(4), Step::Hang).await;
    h.install(&app("A", AppStatus::Active, vec![every("1h"), webhook("gh")])).await;
    h.runtime.activate("A").await.unwrap();

    // An open escalation from an earlier run lets a second run start
    // alongside the manual one.
    let seed = h
        .store
        .create_run(crate::core::activity::NewRun {
            run_id: "seed".into(),
            app_id: "A".into(),
            session_key: "automation:A:seed".into(),
            trigger_type: TriggerType::Manual,
            trigger_data: json!({}),
            started_at: 1,
        })
        .await
        .unwrap();
    let question = h
        .store
        .add_entry(crate::core::activity::NewEntry {
            app_id: "A".into(),
            run_id: seed.run_id.clone(),
            session_key: seed.session_key.clone(),
            entry_type: crate::core::activity::EntryType::Escalation,
            content: crate::core::activity::EntryContent::question("Continue?", None),
        })
        .await
        .unwrap();

    let manual = h.runtime.trigger_manually("A").await.unwrap();
    let followup = h
        .runtime
        .respond_to_escalation("A", &question.id, EscalationAnswer::Text("sure".into()))
        .await
        .unwrap();
    eventually(|| async { h.agent.active() == 2 }).await;
    assert_eq!(h.runtime.running_count(), 2);

    h.runtime.deactivate("A").await;

    for ticket in [manual, followup] {
        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, RunStatus::Error);
        assert_eq!(
            result.error_message.as_deref(),
            Some("Run cancelled: app was deactivated")
        );
    }
    assert_eq!(h.runtime.running_count(), 0);
    assert!(h.scheduler.job_ids().is_empty());
    assert_eq!(h.bus.subscriber_count(), 0);
    assert!(!h.keep_alive.is_held());
    assert!(!h.runtime.is_active("A").await);
    // Cancellations are not failures of the app.
    assert_eq!(h.status("A").await, AppStatus::Active);
}

#[tokio::test]
async fn matching_event_starts_a_run() {
    let h = harness().await;
    h.install(&app("hooks", AppStatus::Active, vec![webhook("stripe")])).await;
    h.runtime.activate("hooks").await.unwrap();

    let other = BusEvent::new("webhook.received", json!({ "hook": "github" }));
    assert_eq!(h.bus.publish(other), 0);

    let event = BusEvent::new("webhook.received", json!({ "hook": "stripe", "amount": 12 }));
    assert_eq!(h.bus.publish(event), 1);

    eventually(|| async {
        h.runs("hooks")
            .await
            .first()
            .is_some_and(|r| r.status == RunStatus::Ok)
    })
    .await;
    let runs = h.runs("hooks").await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger_type, TriggerType::Event);
    let request = &h.agent.calls()[0];
    assert!(request.instructions.contains("webhook.received"));
    assert!(request.instructions.contains("\"amount\": 12"));
}

#[tokio::test]
async fn sync_reconciles_jobs_with_the_current_spec() {
    let h = harness().await;
    let mut a = app("A", AppStatus::Active, vec![every("30m")]);
    h.install(&a).await;

    assert!(h.runtime.sync_app_schedule("A").await.unwrap().is_noop());

    h.runtime.activate("A").await.unwrap();
    a.spec.subscriptions = vec![
        Subscription {
            source: every("1h"),
            filter: Vec::new(),
        },
        Subscription {
            source: SubscriptionSource::Schedule {
                every: None,
                cron: Some("0 0 9 * * *".into()),
            },
            filter: Vec::new(),
        },
    ];
    h.registry.update_spec("A", &a.spec).await.unwrap();

    let report = h.runtime.sync_app_schedule("A").await.unwrap();
    assert_eq!(report.updated, vec!["A:sub-0"]);
    assert_eq!(report.added, vec!["A:sub-1"]);
    assert!(report.removed.is_empty());
    assert_eq!(h.scheduler.job_ids(), vec!["A:sub-0", "A:sub-1"]);

    a.spec.subscriptions.truncate(1);
    h.registry.update_spec("A", &a.spec).await.unwrap();
    let report = h.runtime.sync_app_schedule("A").await.unwrap();
    assert_eq!(report.removed, vec!["A:sub-1"]);
    assert_eq!(report.unchanged, vec!["A:sub-0"]);
    assert_eq!(h.scheduler.job_ids(), vec!["A:sub-0"]);

    a.spec.subscriptions.clear();
    h.registry.update_spec("A", &a.spec).await.unwrap();
    let report = h.runtime.sync_app_schedule("A").await.unwrap();
    assert_eq!(report.removed, vec!["A:sub-0"]);
    assert!(h.scheduler.job_ids().is_empty());
    assert!(!h.keep_alive.is_held());
}

#[tokio::test]
async fn failed_sync_keeps_tracking_jobs_it_already_added() {
    let h = harness().await;
    let mut a = app("A", AppStatus::Active, vec![every("30m")]);
    h.install(&a).await;
    h.runtime.activate("A").await.unwrap();

    a.spec.subscriptions = [every("30m"), every("1h"), every("2h")]
        .into_iter()
        .map(|source| Subscription {
            source,
            filter: Vec::new(),
        })
        .collect();
    h.registry.update_spec("A", &a.spec).await.unwrap();
    h.scheduler.refuse("A:sub-2");

    let err = h.runtime.sync_app_schedule("A").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Internal(_)));
    assert_eq!(h.scheduler.job_ids(), vec!["A:sub-0", "A:sub-1"]);
    assert!(h.runtime.is_active("A").await);

    h.runtime.deactivate("A").await;
    assert!(h.scheduler.job_ids().is_empty());
    assert!(!h.keep_alive.is_held());
}
