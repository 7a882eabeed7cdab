use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;
use warden_core::{
    ArtifactCommit, PipelineStore, Proposal, Record, RecordId, Result, StageFlags, Tier,
    TierArtifact, TierOutput, WardenError,
};

use crate::proposals::insert_proposal_on;
use crate::store::{SqliteStore, parse_time, store_err};

/// Flag column owned by `tier`. A tier only ever writes its own column.
fn flag_column(tier: Tier) -> &'static str {
    match tier {
        Tier::Patterns => "patterns_done",
        Tier::Synthesis => "synthesis_done",
    }
}

type RecordRow = (i64, String, String, bool, bool, String);

fn read_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get::<_, i32>(3)? != 0,
        row.get::<_, i32>(4)? != 0,
        row.get(5)?,
    ))
}

fn record_from(row: RecordRow) -> Result<Record> {
    let (id, payload, source, patterns_done, synthesis_done, created_at) = row;
    Ok(Record {
        id,
        payload: serde_json::from_str(&payload)?,
        source,
        stage_flags: StageFlags {
            patterns_done,
            synthesis_done,
        },
        created_at: parse_time(&created_at)?,
    })
}

/// Insert-or-ignore by output key. Returns `(output_id, written)`.
fn insert_output_on(conn: &Connection, tier: Tier, artifact: &TierArtifact) -> Result<(i64, bool)> {
    let key = artifact.output_key(tier);
    let written = conn
        .execute(
            "INSERT OR IGNORE INTO tier_outputs (tier, output_key, sources, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tier.as_str(),
                key,
                serde_json::to_string(&artifact.sorted_sources())?,
                artifact.content.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
    let id: i64 = conn
        .query_row(
            "SELECT id FROM tier_outputs WHERE output_key = ?1",
            params![key],
            |row| row.get(0),
        )
        .map_err(store_err)?;
    Ok((id, written == 1))
}

impl PipelineStore for SqliteStore {
    fn insert_record(&self, payload: &Value, source: &str) -> Result<RecordId> {
        let db = self.db();
        db.execute(
            "INSERT INTO records (payload, source, created_at) VALUES (?1, ?2, ?3)",
            params![payload.to_string(), source, Utc::now().to_rfc3339()],
        )
        .map_err(store_err)?;
        Ok(db.last_insert_rowid())
    }

    fn get_record(&self, id: RecordId) -> Result<Option<Record>> {
        let db = self.db();
        let row = db
            .query_row(
                "SELECT id, payload, source, patterns_done, synthesis_done, created_at
                 FROM records WHERE id = ?1",
                params![id],
                read_record,
            )
            .optional()
            .map_err(store_err)?;
        row.map(record_from).transpose()
    }

    fn claim_batch(
        &self,
        tier: Tier,
        limit: usize,
        lease_secs: i64,
        token: &str,
    ) -> Result<Vec<Record>> {
        let now = Utc::now().timestamp();
        let flag = flag_column(tier);
        let mut db = self.db();
        let tx = db.transaction().map_err(store_err)?;

        let expired = tx
            .execute(
                "DELETE FROM record_claims WHERE tier = ?1 AND expires_at <= ?2",
                params![tier.as_str(), now],
            )
            .map_err(store_err)?;
        if expired > 0 {
            debug!(tier = %tier, expired, "dropped expired claims");
        }

        let rows = {
            let mut stmt = tx
                .prepare(&format!(
                    "SELECT r.id, r.payload, r.source, r.patterns_done, r.synthesis_done, r.created_at
                     FROM records r
                     WHERE r.{flag} = 0
                       AND NOT EXISTS (
                           SELECT 1 FROM record_claims c WHERE c.record_id = r.id AND c.tier = ?1
                       )
                     ORDER BY r.id
                     LIMIT ?2"
                ))
                .map_err(store_err)?;
            stmt.query_map(params![tier.as_str(), limit as i64], read_record)
                .map_err(store_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(store_err)?
        };

        for (id, ..) in &rows {
            tx.execute(
                "INSERT INTO record_claims (record_id, tier, token, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![id, tier.as_str(), token, now + lease_secs],
            )
            .map_err(store_err)?;
        }
        tx.commit().map_err(store_err)?;

        rows.into_iter().map(record_from).collect()
    }

    fn commit_artifact(
        &self,
        tier: Tier,
        token: &str,
        artifact: &TierArtifact,
        proposals: &[Proposal],
    ) -> Result<ArtifactCommit> {
        let now = Utc::now().timestamp();
        let flag = flag_column(tier);
        let sources = artifact.sorted_sources();
        let mut db = self.db();
        let tx = db.transaction().map_err(store_err)?;

        // Every source must still be leased to us and unflagged.
        for id in &sources {
            let held: Option<(String, i64, bool)> = tx
                .query_row(
                    &format!(
                        "SELECT c.token, c.expires_at, r.{flag}
                         FROM record_claims c JOIN records r ON r.id = c.record_id
                         WHERE c.record_id = ?1 AND c.tier = ?2"
                    ),
                    params![id, tier.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i32>(2)? != 0)),
                )
                .optional()
                .map_err(store_err)?;
            match held {
                Some((holder, expires_at, false)) if holder == token && expires_at > now => {}
                _ => {
                    return Err(WardenError::StaleClaim {
                        record_id: *id,
                        tier: tier.to_string(),
                    });
                }
            }
        }

        let (output_id, output_written) = insert_output_on(&tx, tier, artifact)?;

        let mut records_flagged = 0;
        for id in &sources {
            records_flagged += tx
                .execute(
                    &format!("UPDATE records SET {flag} = 1 WHERE id = ?1 AND {flag} = 0"),
                    params![id],
                )
                .map_err(store_err)?;
            tx.execute(
                "DELETE FROM record_claims WHERE record_id = ?1 AND tier = ?2 AND token = ?3",
                params![id, tier.as_str(), token],
            )
            .map_err(store_err)?;
        }

        for proposal in proposals {
            insert_proposal_on(&tx, proposal)?;
        }

        tx.commit().map_err(store_err)?;
        Ok(ArtifactCommit {
            output_id,
            output_written,
            records_flagged,
            proposal_ids: proposals.iter().map(|p| p.id).collect(),
        })
    }

    fn release_claims(&self, tier: Tier, token: &str) -> Result<usize> {
        let db = self.db();
        db.execute(
            "DELETE FROM record_claims WHERE tier = ?1 AND token = ?2",
            params![tier.as_str(), token],
        )
        .map_err(store_err)
    }

    fn insert_tier_output(&self, tier: Tier, artifact: &TierArtifact) -> Result<bool> {
        let (_, written) = insert_output_on(&self.db(), tier, artifact)?;
        Ok(written)
    }

    fn tier_outputs(&self, tier: Tier) -> Result<Vec<TierOutput>> {
        let db = self.db();
        let mut stmt = db
            .prepare(
                "SELECT id, output_key, sources, content, created_at
                 FROM tier_outputs WHERE tier = ?1 ORDER BY id",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![tier.as_str()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter()
            .map(|(id, output_key, sources, content, created_at)| {
                Ok(TierOutput {
                    id,
                    tier,
                    output_key,
                    sources: serde_json::from_str(&sources)?,
                    content: serde_json::from_str(&content)?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }

    fn pending_count(&self, tier: Tier) -> Result<usize> {
        let db = self.db();
        let n: i64 = db
            .query_row(
                &format!("SELECT COUNT(*) FROM records WHERE {} = 0", flag_column(tier)),
                [],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        Ok(n as usize)
    }
}
