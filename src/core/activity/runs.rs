use anyhow::Result;
use rusqlite::{OptionalExtension, Row, params};

use super::types::{AutomationRun, NewRun, RUN_INTERRUPTED, RunCompletion, RunStatus, TriggerType};
use super::{ActivityStore, conversion_error, parse_json};

const RUN_COLUMNS: &str = "run_id, app_id, session_key, status, trigger_type, trigger_data,
     started_at, finished_at, duration_ms, tokens_used, error_message";

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<AutomationRun> {
    let status: String = row.get(3)?;
    let trigger_type: String = row.get(4)?;
    Ok(AutomationRun {
        run_id: row.get(0)?,
        app_id: row.get(1)?,
        session_key: row.get(2)?,
        status: RunStatus::from_status(&status).ok_or_else(|| conversion_error(3, &status))?,
        trigger_type: TriggerType::from_type(&trigger_type)
            .ok_or_else(|| conversion_error(4, &trigger_type))?,
        trigger_data: parse_json(row.get(5)?).unwrap_or(serde_json::Value::Null),
        started_at: row.get(6)?,
        finished_at: row.get(7)?,
        duration_ms: row.get(8)?,
        tokens_used: row.get(9)?,
        error_message: row.get(10)?,
    })
}

impl ActivityStore {
    pub async fn create_run(&self, run: NewRun) -> Result<AutomationRun> {
        let trigger_data = serde_json::to_string(&run.trigger_data)?;
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO automation_runs (run_id, app_id, session_key, status, trigger_type, trigger_data, started_at)
             VALUES (?1, ?2, ?3, 'running', ?4, ?5, ?6)",
            params![
                run.run_id,
                run.app_id,
                run.session_key,
                run.trigger_type.as_str(),
                trigger_data,
                run.started_at
            ],
        )?;
        Ok(AutomationRun {
            run_id: run.run_id,
            app_id: run.app_id,
            session_key: run.session_key,
            status: RunStatus::Running,
            trigger_type: run.trigger_type,
            trigger_data: run.trigger_data,
            started_at: run.started_at,
            finished_at: None,
            duration_ms: None,
            tokens_used: None,
            error_message: None,
        })
    }

    /// Write the final outcome. Returns false when the run is unknown or was
    /// already finished.
    pub async fn finish_run(&self, run_id: &str, completion: &RunCompletion) -> Result<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE automation_runs
             SET status = ?1, finished_at = ?2, duration_ms = ?3, tokens_used = ?4, error_message = ?5
             WHERE run_id = ?6 AND status = 'running'",
            params![
                completion.status.as_str(),
                completion.finished_at,
                completion.duration_ms,
                completion.tokens_used,
                completion.error_message,
                run_id
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<AutomationRun>> {
        let db = self.db.lock().await;
        let run = db
            .query_row(
                &format!("SELECT {} FROM automation_runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id],
                run_from_row,
            )
            .optional()?;
        Ok(run)
    }

    /// Newest-first runs of one app.
    pub async fn runs_for_app(&self, app_id: &str, limit: usize) -> Result<Vec<AutomationRun>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM automation_runs WHERE app_id = ?1
             ORDER BY started_at DESC, rowid DESC LIMIT ?2",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![app_id, limit as i64], run_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The `n` most recent runs, used by the auto-pause guard.
    pub async fn recent_runs(&self, app_id: &str, n: usize) -> Result<Vec<AutomationRun>> {
        self.runs_for_app(app_id, n).await
    }

    /// Close out runs left `running` by a previous process.
    pub async fn mark_interrupted_runs(&self, now: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE automation_runs
             SET status = 'error', finished_at = ?1, duration_ms = ?1 - started_at,
                 error_message = ?2
             WHERE status = 'running'",
            params![now, RUN_INTERRUPTED],
        )?;
        Ok(rows)
    }

    /// Age-based retention; entries follow through the cascade.
    pub async fn prune_runs_before(&self, cutoff: i64) -> Result<usize> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "DELETE FROM automation_runs WHERE started_at < ?1 AND status != 'running'",
            params![cutoff],
        )?;
        Ok(rows)
    }
}
