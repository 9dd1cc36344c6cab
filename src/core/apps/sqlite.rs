use anyhow::{Result, anyhow};
use async_trait::async_trait;
use rusqlite::{OptionalExtension, Row, params};
use tokio::sync::broadcast;
use tracing::info;

use super::{
    AppFilter, AppKind, AppRecord, AppRegistry, AppSpec, AppStatus, AppStatusChange, StatusExtra,
};
use crate::core::activity::{RunStatus, now_ms};
use crate::core::db::SharedDb;

const APP_COLUMNS: &str =
    "id, name, kind, status, spec_json, config_json, error_message, last_run_at, last_run_status";

fn app_from_row(row: &Row<'_>) -> rusqlite::Result<AppRecord> {
    let kind: String = row.get(2)?;
    let status: String = row.get(3)?;
    let spec_json: String = row.get(4)?;
    let config_json: String = row.get(5)?;
    let last_run_status: Option<String> = row.get(8)?;
    Ok(AppRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: AppKind::from_kind(&kind).ok_or_else(|| bad_column(2, &kind))?,
        status: AppStatus::from_status(&status).ok_or_else(|| bad_column(3, &status))?,
        spec: serde_json::from_str::<AppSpec>(&spec_json).map_err(|_| bad_column(4, &spec_json))?,
        config: serde_json::from_str(&config_json).unwrap_or(serde_json::Value::Null),
        error_message: row.get(6)?,
        last_run_at: row.get(7)?,
        last_run_status: last_run_status.as_deref().and_then(RunStatus::from_status),
    })
}

fn bad_column(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unexpected value '{}'", value).into(),
    )
}

/// App registry over the `apps` table. Every status write is echoed on a
/// broadcast channel so the runtime can react to flips it did not make.
#[derive(Clone)]
pub struct SqliteAppRegistry {
    db: SharedDb,
    changes: broadcast::Sender<AppStatusChange>,
}

impl SqliteAppRegistry {
    pub fn new(db: SharedDb) -> Self {
        let (changes, _) = broadcast::channel(256);
        Self { db, changes }
    }

    /// Insert or update an app definition. Run history survives a reinstall.
    pub async fn install_app(&self, app: &AppRecord) -> Result<()> {
        let spec_json = serde_json::to_string(&app.spec)?;
        let config_json = serde_json::to_string(&app.config)?;
        let now = now_ms();
        let previous = {
            let db = self.db.lock().await;
            let previous: Option<String> = db
                .query_row("SELECT status FROM apps WHERE id = ?1", params![app.id], |row| {
                    row.get(0)
                })
                .optional()?;
            db.execute(
                "INSERT INTO apps (id, name, kind, status, spec_json, config_json, error_message, installed_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name, kind = excluded.kind, status = excluded.status,
                    spec_json = excluded.spec_json, config_json = excluded.config_json,
                    error_message = excluded.error_message, updated_at = excluded.updated_at",
                params![
                    app.id,
                    app.name,
                    app.kind.as_str(),
                    app.status.as_str(),
                    spec_json,
                    config_json,
                    app.error_message,
                    now
                ],
            )?;
            previous.as_deref().and_then(AppStatus::from_status)
        };
        info!("Installed app '{}' ({})", app.id, app.status);
        let _ = self.changes.send(AppStatusChange {
            app_id: app.id.clone(),
            previous,
            status: app.status,
        });
        Ok(())
    }

    /// Replace only the spec, e.g. after the user edits a schedule.
    pub async fn update_spec(&self, id: &str, spec: &AppSpec) -> Result<bool> {
        let spec_json = serde_json::to_string(spec)?;
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE apps SET spec_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![spec_json, now_ms(), id],
        )?;
        Ok(rows > 0)
    }

    /// Remove an app; its runs and timeline go with it.
    pub async fn uninstall_app(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM apps WHERE id = ?1", params![id])?;
        if rows > 0 {
            info!("Uninstalled app '{}'", id);
        }
        Ok(rows > 0)
    }
}

#[async_trait]
impl AppRegistry for SqliteAppRegistry {
    async fn get_app(&self, id: &str) -> Result<Option<AppRecord>> {
        let db = self.db.lock().await;
        let app = db
            .query_row(
                &format!("SELECT {} FROM apps WHERE id = ?1", APP_COLUMNS),
                params![id],
                app_from_row,
            )
            .optional()?;
        Ok(app)
    }

    async fn update_status(&self, id: &str, status: AppStatus, extra: StatusExtra) -> Result<()> {
        let previous = {
            let db = self.db.lock().await;
            let previous: Option<String> = db
                .query_row("SELECT status FROM apps WHERE id = ?1", params![id], |row| row.get(0))
                .optional()?;
            let Some(previous) = previous else {
                return Err(anyhow!("app not found: {}", id));
            };
            db.execute(
                "UPDATE apps SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), extra.error_message, now_ms(), id],
            )?;
            AppStatus::from_status(&previous)
        };
        let _ = self.changes.send(AppStatusChange {
            app_id: id.to_string(),
            previous,
            status,
        });
        Ok(())
    }

    async fn update_last_run(&self, id: &str, outcome: RunStatus, error: Option<&str>) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE apps SET last_run_at = ?1, last_run_status = ?2, last_run_error = ?3 WHERE id = ?4",
            params![now_ms(), outcome.as_str(), error, id],
        )?;
        Ok(())
    }

    fn on_app_status_change(&self) -> broadcast::Receiver<AppStatusChange> {
        self.changes.subscribe()
    }

    async fn list_apps(&self, filter: &AppFilter) -> Result<Vec<AppRecord>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM apps ORDER BY installed_at ASC, id ASC",
            APP_COLUMNS
        ))?;
        let rows = stmt.query_map([], app_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let app = row?;
            if filter.matches(&app) {
                out.push(app);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::activity::{ActivityStore, NewRun, TriggerType};
    use crate::core::db;

    fn registry() -> SqliteAppRegistry {
        SqliteAppRegistry::new(db::open_in_memory().unwrap())
    }

    fn active(id: &str) -> AppRecord {
        let mut app = AppRecord::automation(id, id, AppSpec::default());
        app.status = AppStatus::Active;
        app
    }

    #[tokio::test]
    async fn install_then_get_round_trips_record() {
        let reg = registry();
        let mut app = active("digest");
        app.spec.system_prompt = "Summarize".into();
        reg.install_app(&app).await.unwrap();

        let loaded = reg.get_app("digest").await.unwrap().unwrap();
        assert_eq!(loaded.spec.system_prompt, "Summarize");
        assert_eq!(loaded.status, AppStatus::Active);
        assert!(reg.get_app("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_updates_are_broadcast_with_previous() {
        let reg = registry();
        reg.install_app(&active("a")).await.unwrap();
        let mut rx = reg.on_app_status_change();

        reg.update_status("a", AppStatus::Error, StatusExtra::error("broken"))
            .await
            .unwrap();
        let change = rx.recv().await.unwrap();
        assert_eq!(change.previous, Some(AppStatus::Active));
        assert_eq!(change.status, AppStatus::Error);

        let app = reg.get_app("a").await.unwrap().unwrap();
        assert_eq!(app.error_message.as_deref(), Some("broken"));
        assert!(reg.update_status("ghost", AppStatus::Active, StatusExtra::default()).await.is_err());
    }

    #[tokio::test]
    async fn list_filters_by_status() {
        let reg = registry();
        reg.install_app(&active("a")).await.unwrap();
        reg.install_app(&AppRecord::automation("b", "b", AppSpec::default()))
            .await
            .unwrap();
        let apps = reg
            .list_apps(&AppFilter::automations_in(&[AppStatus::Active]))
            .await
            .unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].id, "a");
        assert_eq!(reg.list_apps(&AppFilter::default()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn last_run_is_recorded() {
        let reg = registry();
        reg.install_app(&active("a")).await.unwrap();
        reg.update_last_run("a", RunStatus::Error, Some("timeout"))
            .await
            .unwrap();
        let app = reg.get_app("a").await.unwrap().unwrap();
        assert_eq!(app.last_run_status, Some(RunStatus::Error));
        assert!(app.last_run_at.is_some());
    }

    #[tokio::test]
    async fn uninstall_cascades_run_history() {
        let shared = db::open_in_memory().unwrap();
        let reg = SqliteAppRegistry::new(shared.clone());
        let store = ActivityStore::new(shared);
        reg.install_app(&active("a")).await.unwrap();
        store
            .create_run(NewRun {
                run_id: "r1".into(),
                app_id: "a".into(),
                session_key: "automation:a:r1".into(),
                trigger_type: TriggerType::Manual,
                trigger_data: serde_json::json!({}),
                started_at: 1,
            })
            .await
            .unwrap();

        // Reinstall keeps history.
        reg.install_app(&active("a")).await.unwrap();
        assert!(store.get_run("r1").await.unwrap().is_some());

        assert!(reg.uninstall_app("a").await.unwrap());
        assert!(store.get_run("r1").await.unwrap().is_none());
        assert!(!reg.uninstall_app("a").await.unwrap());
    }
}
