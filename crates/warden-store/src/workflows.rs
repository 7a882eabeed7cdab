use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;
use warden_core::{Result, WardenError, WorkflowDefinition, WorkflowRun, WorkflowStore};

use crate::store::{SqliteStore, store_err};

/// Upsert by name. Shared with proposal application.
pub(crate) fn upsert_definition_on(conn: &Connection, definition: &WorkflowDefinition) -> Result<()> {
    let json = serde_json::to_string(definition)?;
    conn.execute(
        "INSERT INTO workflow_definitions (name, definition, enabled, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(name) DO UPDATE SET
            definition = excluded.definition,
            enabled = excluded.enabled,
            updated_at = excluded.updated_at",
        params![
            definition.name,
            json,
            definition.enabled as i32,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

/// Insert a fresh run or update one still `running` at `expected`.
fn write_run(conn: &Connection, run: &WorkflowRun, expected: u64, state: &str) -> Result<bool> {
    let now = Utc::now().to_rfc3339();
    let changed = if expected == 0 {
        conn.execute(
            "INSERT INTO workflow_runs (id, definition, status, state, version, started_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO NOTHING",
            params![
                run.id.to_string(),
                run.definition,
                run.status.as_str(),
                state,
                run.version as i64,
                run.started_at.to_rfc3339(),
                now,
            ],
        )
    } else {
        conn.execute(
            "UPDATE workflow_runs SET status = ?2, state = ?3, version = ?4, updated_at = ?5
             WHERE id = ?1 AND version = ?6 AND status = 'running'",
            params![
                run.id.to_string(),
                run.status.as_str(),
                state,
                run.version as i64,
                now,
                expected as i64,
            ],
        )
    }
    .map_err(store_err)?;
    Ok(changed == 1)
}

impl WorkflowStore for SqliteStore {
    fn upsert_definition(&self, definition: &WorkflowDefinition) -> Result<()> {
        upsert_definition_on(&self.db(), definition)
    }

    fn get_definition(&self, name: &str) -> Result<Option<WorkflowDefinition>> {
        let db = self.db();
        let json: Option<String> = db
            .query_row(
                "SELECT definition FROM workflow_definitions WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(json.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>> {
        let db = self.db();
        let mut stmt = db
            .prepare("SELECT definition FROM workflow_definitions ORDER BY name")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.iter()
            .map(|j| serde_json::from_str(j).map_err(Into::into))
            .collect()
    }

    fn save_run(&self, run: &mut WorkflowRun) -> Result<()> {
        let expected = run.version;
        run.version = expected + 1;
        let written = match serde_json::to_string(&*run) {
            Ok(state) => write_run(&self.db(), run, expected, &state),
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(true) => Ok(()),
            Ok(false) => {
                run.version = expected;
                debug!(run_id = %run.id, version = expected, "run save lost a race");
                Err(WardenError::StaleRun(run.id))
            }
            Err(e) => {
                run.version = expected;
                Err(e)
            }
        }
    }

    fn get_run(&self, id: Uuid) -> Result<Option<WorkflowRun>> {
        let db = self.db();
        let state: Option<String> = db
            .query_row(
                "SELECT state FROM workflow_runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(state.map(|s| serde_json::from_str(&s)).transpose()?)
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>> {
        let db = self.db();
        let mut stmt = db
            .prepare("SELECT state FROM workflow_runs ORDER BY started_at DESC LIMIT ?1")
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(Into::into))
            .collect()
    }
}
