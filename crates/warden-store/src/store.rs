use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use warden_core::{Result, WardenError};

/// Shared handle to the Warden database. Cloning is cheap.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening warden store");

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && path != Path::new(":memory:")
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path).map_err(store_err)?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")
            .map_err(store_err)?;

        conn.execute_batch(SCHEMA).map_err(store_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Raw connection access for ad-hoc queries.
    pub fn db(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.db.lock()
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS boundary_rules (
    id TEXT PRIMARY KEY,
    rule_type TEXT NOT NULL,
    category TEXT NOT NULL,
    predicate TEXT NOT NULL,
    effect TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    expires_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_definitions (
    name TEXT PRIMARY KEY,
    definition TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workflow_runs (
    id TEXT PRIMARY KEY,
    definition TEXT NOT NULL,
    status TEXT NOT NULL,
    state TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS proposals (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    change TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    status TEXT NOT NULL DEFAULT 'proposed',
    decided_by TEXT,
    decided_at TEXT,
    notes TEXT,
    applied_at TEXT,
    reverted_at TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS proposal_applications (
    proposal_id TEXT PRIMARY KEY REFERENCES proposals(id),
    applied_at TEXT NOT NULL,
    outcome TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS preferences (
    category TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    source TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL,
    PRIMARY KEY (category, key)
);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT NOT NULL,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    source TEXT NOT NULL,
    patterns_done INTEGER NOT NULL DEFAULT 0,
    synthesis_done INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS record_claims (
    record_id INTEGER NOT NULL REFERENCES records(id),
    tier TEXT NOT NULL,
    token TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (record_id, tier)
);

CREATE TABLE IF NOT EXISTS tier_outputs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tier TEXT NOT NULL,
    output_key TEXT NOT NULL UNIQUE,
    sources TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    subject_kind TEXT NOT NULL,
    subject_id TEXT NOT NULL,
    event TEXT NOT NULL,
    details TEXT NOT NULL,
    checksum TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_category ON boundary_rules(category, active);
CREATE INDEX IF NOT EXISTS idx_runs_started ON workflow_runs(started_at);
CREATE INDEX IF NOT EXISTS idx_proposals_status ON proposals(status);
CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);
CREATE INDEX IF NOT EXISTS idx_records_patterns ON records(patterns_done);
CREATE INDEX IF NOT EXISTS idx_records_synthesis ON records(synthesis_done);
CREATE INDEX IF NOT EXISTS idx_outputs_tier ON tier_outputs(tier);
CREATE INDEX IF NOT EXISTS idx_audit_subject ON audit_log(subject_id);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
";

pub(crate) fn store_err(e: rusqlite::Error) -> WardenError {
    WardenError::Store(e.to_string())
}

pub(crate) fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| WardenError::Store(format!("bad timestamp '{raw}': {e}")))
}

pub(crate) fn parse_opt_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_time).transpose()
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| WardenError::Store(format!("bad id '{raw}': {e}")))
}
