use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{ActivityEntry, EntryContent, EntryType, NewEntry, UserResponse};
use super::{ActivityStore, conversion_error, now_ms};

const ENTRY_COLUMNS: &str = "id, app_id, run_id, type, ts, session_key, content, user_response";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<ActivityEntry> {
    let entry_type: String = row.get(3)?;
    let content: String = row.get(6)?;
    let user_response: Option<String> = row.get(7)?;
    Ok(ActivityEntry {
        id: row.get(0)?,
        app_id: row.get(1)?,
        run_id: row.get(2)?,
        entry_type: EntryType::from_type(&entry_type)
            .ok_or_else(|| conversion_error(3, &entry_type))?,
        ts: row.get(4)?,
        session_key: row.get(5)?,
        content: serde_json::from_str::<EntryContent>(&content)
            .unwrap_or_else(|_| EntryContent::summary(content)),
        user_response: user_response.and_then(|raw| serde_json::from_str(&raw).ok()),
    })
}

impl ActivityStore {
    pub async fn add_entry(&self, entry: NewEntry) -> Result<ActivityEntry> {
        let id = uuid::Uuid::new_v4().to_string();
        let ts = now_ms();
        let content = serde_json::to_string(&entry.content)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO activity_entries (id, app_id, run_id, type, ts, session_key, content)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id,
                entry.app_id,
                entry.run_id,
                entry.entry_type.as_str(),
                ts,
                entry.session_key,
                content
            ],
        )?;
        Ok(ActivityEntry {
            id,
            app_id: entry.app_id,
            run_id: entry.run_id,
            entry_type: entry.entry_type,
            ts,
            session_key: entry.session_key,
            content: entry.content,
            user_response: None,
        })
    }

    pub async fn get_entry(&self, id: &str) -> Result<Option<ActivityEntry>> {
        let db = self.db.lock().await;
        let entry = db
            .query_row(
                &format!("SELECT {} FROM activity_entries WHERE id = ?1", ENTRY_COLUMNS),
                params![id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Newest-first timeline of one app.
    pub async fn entries_for_app(&self, app_id: &str, limit: usize) -> Result<Vec<ActivityEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM activity_entries WHERE app_id = ?1
             ORDER BY ts DESC, rowid DESC LIMIT ?2",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![app_id, limit as i64], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub async fn count_entries_for_run(&self, run_id: &str) -> Result<usize> {
        let db = self.db.lock().await;
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM activity_entries WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Most recent unanswered escalation of an app, optionally narrowed to one run.
    pub async fn latest_pending_escalation(
        &self,
        app_id: &str,
        run_id: Option<&str>,
    ) -> Result<Option<ActivityEntry>> {
        let db = self.db.lock().await;
        let entry = db
            .query_row(
                &format!(
                    "SELECT {} FROM activity_entries
                     WHERE app_id = ?1 AND type = 'escalation' AND user_response IS NULL
                       AND (?2 IS NULL OR run_id = ?2)
                     ORDER BY ts DESC, rowid DESC LIMIT 1",
                    ENTRY_COLUMNS
                ),
                params![app_id, run_id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every unanswered escalation across all apps, oldest first.
    pub async fn pending_escalations(&self) -> Result<Vec<ActivityEntry>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM activity_entries
             WHERE type = 'escalation' AND user_response IS NULL
             ORDER BY ts ASC, rowid ASC",
            ENTRY_COLUMNS
        ))?;
        let rows = stmt.query_map([], entry_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Set `user_response` on a still-pending escalation owned by `app_id`.
    /// Returns false if no such pending entry exists, which makes the
    /// respond and timeout paths mutually exclusive.
    pub async fn resolve_escalation(
        &self,
        app_id: &str,
        entry_id: &str,
        response: &UserResponse,
    ) -> Result<bool> {
        let json = serde_json::to_string(response)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE activity_entries SET user_response = ?1
             WHERE id = ?2 AND app_id = ?3 AND type = 'escalation' AND user_response IS NULL",
            params![json, entry_id, app_id],
        )?;
        Ok(rows > 0)
    }
}
