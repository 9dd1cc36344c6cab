use anyhow::Result;
use tracing::debug;

use super::notify::Notifier;
use crate::core::activity::{ActivityEntry, ActivityStore, EntryContent, EntryType, NewEntry};

/// Timeline writer bound to one run. Handed to the agent so it can report
/// progress, results and questions while it works.
#[derive(Clone)]
pub struct RunReporter {
    store: ActivityStore,
    notifier: Notifier,
    app_id: String,
    run_id: String,
    session_key: String,
}

impl RunReporter {
    pub(crate) fn new(
        store: ActivityStore,
        notifier: Notifier,
        app_id: &str,
        run_id: &str,
        session_key: &str,
    ) -> Self {
        Self {
            store,
            notifier,
            app_id: app_id.to_string(),
            run_id: run_id.to_string(),
            session_key: session_key.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub async fn report(&self, entry_type: EntryType, content: EntryContent) -> Result<ActivityEntry> {
        let entry = self
            .store
            .add_entry(NewEntry {
                app_id: self.app_id.clone(),
                run_id: self.run_id.clone(),
                session_key: self.session_key.clone(),
                entry_type,
                content,
            })
            .await?;
        debug!(
            "Run {} of app '{}' reported {}",
            self.run_id,
            self.app_id,
            entry_type.as_str()
        );
        self.notifier.entry_added(&entry);
        Ok(entry)
    }

    pub async fn milestone(&self, summary: impl Into<String>) -> Result<ActivityEntry> {
        self.report(EntryType::Milestone, EntryContent::summary(summary)).await
    }

    pub async fn output(
        &self,
        summary: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Result<ActivityEntry> {
        let mut content = EntryContent::summary(summary);
        content.data = data;
        self.report(EntryType::Output, content).await
    }

    /// Ask the user something. The run should then end with a
    /// waiting-for-user outcome.
    pub async fn escalate(
        &self,
        question: impl Into<String>,
        choices: Option<Vec<String>>,
    ) -> Result<ActivityEntry> {
        self.report(EntryType::Escalation, EntryContent::question(question, choices))
            .await
    }

    pub async fn complete(&self, summary: impl Into<String>) -> Result<ActivityEntry> {
        self.report(EntryType::RunComplete, EntryContent::summary(summary)).await
    }

    pub async fn skipped(&self, summary: impl Into<String>) -> Result<ActivityEntry> {
        self.report(EntryType::RunSkipped, EntryContent::summary(summary)).await
    }

    pub async fn error(
        &self,
        summary: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<ActivityEntry> {
        self.report(EntryType::RunError, EntryContent::failure(summary, error)).await
    }
}
