use anyhow::Result;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One SQLite connection shared by the app registry and the activity store.
pub type SharedDb = Arc<Mutex<Connection>>;

pub fn open(path: &Path) -> Result<SharedDb> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn open_in_memory() -> Result<SharedDb> {
    let conn = Connection::open_in_memory()?;
    migrate(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn migrate(db: &Connection) -> Result<()> {
    db.execute_batch("PRAGMA foreign_keys = ON;")?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS apps (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            status TEXT NOT NULL,
            spec_json TEXT NOT NULL,
            config_json TEXT NOT NULL DEFAULT '{}',
            error_message TEXT,
            last_run_at INTEGER,
            last_run_status TEXT,
            last_run_error TEXT,
            installed_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS automation_runs (
            run_id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            session_key TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            trigger_data TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            duration_ms INTEGER,
            tokens_used INTEGER,
            error_message TEXT
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_automation_runs_app_started
         ON automation_runs(app_id, started_at DESC)",
        [],
    )?;

    db.execute(
        "CREATE TABLE IF NOT EXISTS activity_entries (
            id TEXT PRIMARY KEY,
            app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
            run_id TEXT NOT NULL REFERENCES automation_runs(run_id) ON DELETE CASCADE,
            type TEXT NOT NULL,
            ts INTEGER NOT NULL,
            session_key TEXT NOT NULL,
            content TEXT NOT NULL,
            user_response TEXT
        )",
        [],
    )?;

    db.execute(
        "CREATE INDEX IF NOT EXISTS idx_activity_entries_app_ts
         ON activity_entries(app_id, ts DESC)",
        [],
    )?;

    Ok(())
}
