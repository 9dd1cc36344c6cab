//! Durable run history and the user-facing activity timeline.
//!
//! Pure persistence: every write is a single statement under the shared
//! connection lock, so a run's final status and each entry insert are
//! atomic. Nothing here decides what a status means.

mod entries;
mod runs;
pub mod types;

pub use types::{
    ActivityEntry, AutomationRun, EntryContent, EntryType, NewEntry, NewRun, RUN_CANCELLED,
    RUN_INTERRUPTED, RunCompletion, RunStatus, TriggerType, UserResponse,
};

use anyhow::Result;
use std::path::Path;

use crate::core::db::{self, SharedDb};

#[derive(Clone)]
pub struct ActivityStore {
    db: SharedDb,
}

impl ActivityStore {
    pub fn new(db: SharedDb) -> Self {
        Self { db }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(db::open(path)?))
    }

    pub fn get_db(&self) -> SharedDb {
        self.db.clone()
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

fn conversion_error(column: usize, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("unexpected value '{}'", value).into(),
    )
}

/// Store over a fresh in-memory database with one installed app per id.
#[cfg(test)]
pub async fn test_activity_store(app_ids: &[&str]) -> ActivityStore {
    let store = ActivityStore::new(db::open_in_memory().expect("open in-memory db"));
    {
        let conn = store.db.lock().await;
        for id in app_ids {
            conn.execute(
                "INSERT INTO apps (id, name, kind, status, spec_json, installed_at, updated_at)
                 VALUES (?1, ?1, 'automation', 'active', '{}', 0, 0)",
                rusqlite::params![id],
            )
            .expect("seed app");
        }
    }
    store
}
