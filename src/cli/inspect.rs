use anyhow::Result;
use chrono::DateTime;
use console::style;

use crate::config::{CONSECUTIVE_ERROR_THRESHOLD, ERROR_STREAK_WINDOW, RuntimeConfig};
use crate::core::activity::{ActivityEntry, ActivityStore, EntryType, RunStatus, now_ms};
use crate::core::apps::{
    AppFilter, AppRecord, AppRegistry, AppStatus, SqliteAppRegistry, SubscriptionSource,
};
use crate::core::db;
use crate::core::runtime::leading_errors;
use crate::core::terminal::{
    BELL, GuideSection, print_error, print_info, print_success, print_warn,
};

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

pub(crate) fn format_ts(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

pub(crate) fn describe_source(source: &SubscriptionSource) -> String {
    match source {
        SubscriptionSource::Schedule { every: Some(every), .. } => format!("every {}", every),
        SubscriptionSource::Schedule { cron: Some(cron), .. } => format!("cron \"{}\"", cron),
        SubscriptionSource::Schedule { .. } => "schedule (unset)".to_string(),
        SubscriptionSource::File { path, events } if events.is_empty() => {
            format!("file {}", path)
        }
        SubscriptionSource::File { path, events } => {
            format!("file {} ({})", path, events.join(", "))
        }
        SubscriptionSource::Webhook { hook } => format!("webhook {}", hook),
        SubscriptionSource::Webpage { url } => format!("webpage {}", url),
        SubscriptionSource::Rss { url } => format!("rss {}", url),
    }
}

fn app_status_label(status: AppStatus) -> String {
    let text = status.as_str().to_uppercase();
    match status {
        AppStatus::Active => style(text).green().bold().to_string(),
        AppStatus::WaitingUser => style(text).yellow().bold().to_string(),
        AppStatus::Error => style(text).red().bold().to_string(),
        AppStatus::Installed | AppStatus::Paused => style(text).dim().to_string(),
    }
}

fn run_status_label(status: RunStatus) -> String {
    let text = status.as_str();
    match status {
        RunStatus::Ok => style(text).green().to_string(),
        RunStatus::Error => style(text).red().to_string(),
        RunStatus::WaitingUser => style(text).yellow().to_string(),
        RunStatus::Running => style(text).cyan().to_string(),
        RunStatus::Skipped => style(text).dim().to_string(),
    }
}

fn entry_line(entry: &ActivityEntry) -> String {
    let mut line = format!("{} {}", style(entry.entry_type.as_str()).bold(), entry.content.summary);
    if let Some(error) = &entry.content.error {
        line.push_str(&format!(" ({})", style(error).red()));
    }
    if entry.entry_type == EntryType::Escalation {
        match &entry.user_response {
            Some(response) if response.timed_out => line.push_str(" [timed out]"),
            Some(response) => line.push_str(&format!(" [answered: {}]", response.literal())),
            None => line.push_str(&format!(" {}", style("[waiting]").yellow())),
        }
    }
    line
}

/// Read-side access to the registry and history for operator commands.
pub(crate) struct Inspector {
    registry: SqliteAppRegistry,
    store: ActivityStore,
}

impl Inspector {
    pub(crate) fn open(config: &RuntimeConfig) -> Result<Self> {
        let shared = db::open(&config.database_path())?;
        Ok(Self {
            registry: SqliteAppRegistry::new(shared.clone()),
            store: ActivityStore::new(shared),
        })
    }

    async fn find_app(&self, app_id: &str) -> Result<Option<AppRecord>> {
        let app = self.registry.get_app(app_id).await?;
        if app.is_none() {
            print_error(&format!("App '{}' is not installed", app_id));
        }
        Ok(app)
    }

    pub(crate) async fn status(&self) -> Result<()> {
        let apps = self
            .registry
            .list_apps(&AppFilter::automations_in(&[]))
            .await?;
        if apps.is_empty() {
            print_info("No automation apps installed.");
            return Ok(());
        }

        for app in apps {
            let recent = self.store.recent_runs(&app.id, ERROR_STREAK_WINDOW).await?;
            let streak = leading_errors(&recent);
            let sources: Vec<String> = app
                .spec
                .subscriptions
                .iter()
                .map(|s| describe_source(&s.source))
                .collect();

            let mut section = GuideSection::new(&format!("{} · {}", app.name, app.id))
                .status("Status", &app_status_label(app.status))
                .status(
                    "Triggers",
                    &if sources.is_empty() {
                        style("none").dim().to_string()
                    } else {
                        sources.join(", ")
                    },
                );
            section = match recent.first() {
                Some(run) => section.status(
                    "Last run",
                    &format!("{} at {}", run_status_label(run.status), format_ts(run.started_at)),
                ),
                None => section.status("Last run", &style("never").dim().to_string()),
            };
            if streak > 0 {
                section = section.status(
                    "Failures",
                    &format!("{} in a row (pauses at {})", streak, CONSECUTIVE_ERROR_THRESHOLD),
                );
            }
            if let Some(message) = &app.error_message {
                section = section.status("Error", &style(message).red().to_string());
            }
            if let Some(entry) = self.store.latest_pending_escalation(&app.id, None).await? {
                let question = entry.content.question.as_deref().unwrap_or(&entry.content.summary);
                section = section.status("Waiting on", &format!("{}{}", BELL, question));
            }
            section.print();
        }
        println!();
        Ok(())
    }

    pub(crate) async fn runs(&self, app_id: &str, limit: usize) -> Result<()> {
        if self.find_app(app_id).await?.is_none() {
            return Ok(());
        }
        let runs = self.store.runs_for_app(app_id, limit).await?;
        let mut section = GuideSection::new(&format!("Runs · {}", app_id));
        for run in &runs {
            let mut detail = format!(
                "{} {}",
                run_status_label(run.status),
                style(run.trigger_type.as_str()).dim()
            );
            if let Some(ms) = run.duration_ms {
                detail.push_str(&format!(" {}ms", ms));
            }
            if let Some(tokens) = run.tokens_used {
                detail.push_str(&format!(" {} tokens", tokens));
            }
            if let Some(error) = &run.error_message {
                detail.push_str(&format!(" {}", style(error).red()));
            }
            section = section.status(&format_ts(run.started_at), &detail);
        }
        if section.is_empty() {
            section = section.text("No runs recorded yet.");
        }
        section.print();
        println!();
        Ok(())
    }

    pub(crate) async fn activity(&self, app_id: &str, limit: usize) -> Result<()> {
        if self.find_app(app_id).await?.is_none() {
            return Ok(());
        }
        let entries = self.store.entries_for_app(app_id, limit).await?;
        let mut section = GuideSection::new(&format!("Activity · {}", app_id));
        for entry in &entries {
            section = section.status(&format_ts(entry.ts), &entry_line(entry));
        }
        if section.is_empty() {
            section = section.text("Nothing has happened yet.");
        }
        section.print();
        println!();
        Ok(())
    }

    pub(crate) async fn pending(&self) -> Result<()> {
        let pending = self.store.pending_escalations().await?;
        if pending.is_empty() {
            print_info("No escalations are waiting for an answer.");
            return Ok(());
        }
        let mut section = GuideSection::new("Waiting for you");
        for entry in &pending {
            let question = entry.content.question.as_deref().unwrap_or(&entry.content.summary);
            let mut line = format!("{}{}", BELL, question);
            if let Some(choices) = &entry.content.choices {
                line.push_str(&format!(" [{}]", choices.join(" / ")));
            }
            line.push_str(&format!(
                " {}",
                style(format!("(entry {}, asked {})", entry.id, format_ts(entry.ts))).dim()
            ));
            section = section.status(&entry.app_id, &line);
        }
        section.print();
        println!();
        Ok(())
    }

    pub(crate) async fn prune(&self, days: u32) -> Result<()> {
        if days == 0 {
            print_warn("Retention is disabled; nothing pruned.");
            return Ok(());
        }
        let cutoff = now_ms() - i64::from(days) * DAY_MS;
        let pruned = self.store.prune_runs_before(cutoff).await?;
        print_success(&format!(
            "Pruned {} run(s) older than {} day(s)",
            pruned, days
        ));
        Ok(())
    }
}
