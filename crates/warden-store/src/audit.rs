use chrono::Utc;
use rusqlite::params;
use warden_core::{AuditEntry, AuditLog, AuditRecord, Result};

use crate::store::{SqliteStore, parse_time, store_err};

type AuditRow = (i64, String, String, String, String, String, String);

fn read_audit(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn audit_from(row: AuditRow) -> Result<AuditRecord> {
    let (id, timestamp, subject_kind, subject_id, event, details, checksum) = row;
    Ok(AuditRecord {
        id,
        subject_kind: subject_kind.parse()?,
        subject_id,
        event,
        details: serde_json::from_str(&details)?,
        timestamp: parse_time(&timestamp)?,
        checksum,
    })
}

impl AuditLog for SqliteStore {
    /// Append an entry with a tamper-evident checksum.
    fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let now = Utc::now();
        let timestamp = now.to_rfc3339();
        let details = entry.details.to_string();
        let checksum = AuditRecord::compute_checksum(
            &timestamp,
            entry.subject_kind,
            &entry.subject_id,
            &entry.event,
            &details,
        );

        let db = self.db();
        db.execute(
            "INSERT INTO audit_log (timestamp, subject_kind, subject_id, event, details, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                timestamp,
                entry.subject_kind.as_str(),
                entry.subject_id,
                entry.event,
                details,
                checksum,
            ],
        )
        .map_err(store_err)?;

        Ok(AuditRecord {
            id: db.last_insert_rowid(),
            subject_kind: entry.subject_kind,
            subject_id: entry.subject_id,
            event: entry.event,
            details: entry.details,
            timestamp: now,
            checksum,
        })
    }

    fn for_subject(&self, subject_id: &str) -> Result<Vec<AuditRecord>> {
        let db = self.db();
        let mut stmt = db
            .prepare(
                "SELECT id, timestamp, subject_kind, subject_id, event, details, checksum
                 FROM audit_log WHERE subject_id = ?1 ORDER BY id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![subject_id], read_audit)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(audit_from).collect()
    }

    fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let db = self.db();
        let mut stmt = db
            .prepare(
                "SELECT id, timestamp, subject_kind, subject_id, event, details, checksum
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![limit as i64], read_audit)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(audit_from).collect()
    }
}
