//! Why a run started, as data and as prose.
//!
//! Everything here is pure: the caller supplies the clock.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::core::activity::{ActivityEntry, TriggerType, UserResponse};
use crate::core::apps::AppRecord;
use crate::core::collab::{BusEvent, JobDescriptor, Schedule};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerPayload {
    Schedule {
        job_id: String,
        schedule: Schedule,
    },
    Event {
        event_id: String,
        event_type: String,
        source: String,
        payload: Value,
    },
    Manual,
    EscalationFollowup {
        entry_id: String,
        question: String,
        response: UserResponse,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggerContext {
    #[serde(rename = "type")]
    pub trigger_type: TriggerType,
    pub description: String,
    pub payload: TriggerPayload,
    pub fired_at: i64,
}

fn stamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl TriggerContext {
    pub fn schedule(job: &JobDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            trigger_type: TriggerType::Schedule,
            description: format!(
                "Scheduled run ({}) at {}.",
                job.schedule.describe(),
                stamp(now)
            ),
            payload: TriggerPayload::Schedule {
                job_id: job.id.clone(),
                schedule: job.schedule.clone(),
            },
            fired_at: now.timestamp_millis(),
        }
    }

    pub fn event(event: &BusEvent, source: &str, now: DateTime<Utc>) -> Self {
        let pretty = serde_json::to_string_pretty(&event.payload)
            .unwrap_or_else(|_| event.payload.to_string());
        Self {
            trigger_type: TriggerType::Event,
            description: format!(
                "Triggered by {} event `{}` at {}.\nEvent payload:\n```json\n{}\n```",
                source,
                event.event_type,
                stamp(now),
                pretty
            ),
            payload: TriggerPayload::Event {
                event_id: event.id.clone(),
                event_type: event.event_type.clone(),
                source: source.to_string(),
                payload: event.payload.clone(),
            },
            fired_at: now.timestamp_millis(),
        }
    }

    pub fn manual(now: DateTime<Utc>) -> Self {
        Self {
            trigger_type: TriggerType::Manual,
            description: format!("Manually triggered by the user at {}.", stamp(now)),
            payload: TriggerPayload::Manual,
            fired_at: now.timestamp_millis(),
        }
    }

    pub fn escalation_followup(
        entry: &ActivityEntry,
        response: &UserResponse,
        now: DateTime<Utc>,
    ) -> Self {
        let question = entry
            .content
            .question
            .clone()
            .unwrap_or_else(|| entry.content.summary.clone());
        Self {
            trigger_type: TriggerType::EscalationFollowup,
            description: format!(
                "Follow-up to your earlier question: \"{}\"\nThe user responded: \"{}\"",
                question,
                response.literal()
            ),
            payload: TriggerPayload::EscalationFollowup {
                entry_id: entry.id.clone(),
                question,
                response: response.clone(),
            },
            fired_at: now.timestamp_millis(),
        }
    }

    /// JSON stored in the run's `trigger_data` column.
    pub fn to_trigger_data(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Initial instructions for the agent: the app's prompt followed by the
/// trigger description.
pub fn render_instructions(app: &AppRecord, trigger: &TriggerContext) -> String {
    let prompt = app.spec.system_prompt.trim();
    let section = format!("## Why this run started\n{}", trigger.description);
    if prompt.is_empty() {
        section
    } else {
        format!("{}\n\n{}", prompt, section)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::activity::{EntryContent, EntryType};
    use crate::core::apps::AppSpec;
    use crate::core::collab::JobPayload;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn schedule_describes_cadence_and_time() {
        let job = JobDescriptor {
            id: "A:sub-0".into(),
            schedule: Schedule::Every { interval_ms: 30 * 60 * 1000 },
            payload: JobPayload::AppSubscription {
                app_id: "A".into(),
                subscription_index: 0,
            },
        };
        let ctx = TriggerContext::schedule(&job, at());
        assert_eq!(ctx.trigger_type, TriggerType::Schedule);
        assert_eq!(
            ctx.description,
            "Scheduled run (every 30 minutes) at 2026-03-01T09:00:00Z."
        );
        let data = ctx.to_trigger_data();
        assert_eq!(data["type"], "schedule");
        assert_eq!(data["payload"]["job_id"], "A:sub-0");
    }

    #[test]
    fn event_embeds_raw_payload() {
        let event = BusEvent::new("webhook.received", json!({ "hook": "stripe", "amount": 12 }));
        let ctx = TriggerContext::event(&event, "webhook", at());
        assert!(ctx.description.contains("webhook event `webhook.received`"));
        assert!(ctx.description.contains("\"amount\": 12"));
    }

    #[test]
    fn followup_joins_question_and_answer() {
        let entry = ActivityEntry {
            id: "e1".into(),
            app_id: "B".into(),
            run_id: "r1".into(),
            entry_type: EntryType::Escalation,
            ts: 0,
            session_key: "s".into(),
            content: EntryContent::question("Proceed with refund?", Some(vec!["yes".into(), "no".into()])),
            user_response: None,
        };
        let ctx = TriggerContext::escalation_followup(&entry, &UserResponse::choice("yes", 5), at());
        assert!(ctx.description.contains("Proceed with refund?"));
        assert!(ctx.description.contains("\"yes\""));
        assert_eq!(ctx.trigger_type, TriggerType::EscalationFollowup);
    }

    #[test]
    fn instructions_put_prompt_before_trigger() {
        let mut spec = AppSpec::default();
        spec.system_prompt = "Triage the inbox.".into();
        let app = AppRecord::automation("a", "A", spec);
        let text = render_instructions(&app, &TriggerContext::manual(at()));
        assert!(text.starts_with("Triage the inbox.\n\n## Why this run started\nManually"));

        let bare = AppRecord::automation("b", "B", AppSpec::default());
        assert!(render_instructions(&bare, &TriggerContext::manual(at())).starts_with("## Why"));
    }
}
