use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use uuid::Uuid;
use warden_core::{
    ApplyOutcome, Proposal, ProposalStatus, ProposalStore, ProposedChange, Result, WardenError,
};

use crate::preferences::set_preference_on;
use crate::rules::{insert_rule_on, set_rule_active_on};
use crate::store::{SqliteStore, parse_opt_time, parse_time, parse_uuid, store_err};
use crate::workflows::upsert_definition_on;

const PROPOSAL_COLUMNS: &str = "id, kind, change, description, source, confidence, status, \
     decided_by, decided_at, notes, applied_at, reverted_at, created_at";

struct ProposalRow {
    id: String,
    change: String,
    description: String,
    source: String,
    confidence: f64,
    status: String,
    decided_by: Option<String>,
    decided_at: Option<String>,
    notes: Option<String>,
    applied_at: Option<String>,
    reverted_at: Option<String>,
    created_at: String,
}

impl ProposalRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            // column 1 (kind) is derived from the change
            change: row.get(2)?,
            description: row.get(3)?,
            source: row.get(4)?,
            confidence: row.get(5)?,
            status: row.get(6)?,
            decided_by: row.get(7)?,
            decided_at: row.get(8)?,
            notes: row.get(9)?,
            applied_at: row.get(10)?,
            reverted_at: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn into_proposal(self) -> Result<Proposal> {
        let change: ProposedChange = serde_json::from_str(&self.change)?;
        Ok(Proposal {
            id: parse_uuid(&self.id)?,
            kind: change.kind(),
            change,
            description: self.description,
            source: self.source.parse()?,
            confidence: self.confidence,
            status: self.status.parse()?,
            decided_by: self.decided_by,
            decided_at: parse_opt_time(self.decided_at)?,
            notes: self.notes,
            applied_at: parse_opt_time(self.applied_at)?,
            reverted_at: parse_opt_time(self.reverted_at)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Shared with artifact commits, which store carried proposals in the same
/// transaction as the output.
pub(crate) fn insert_proposal_on(conn: &Connection, proposal: &Proposal) -> Result<()> {
    let change = serde_json::to_string(&proposal.change)?;
    conn.execute(
        &format!("INSERT INTO proposals ({PROPOSAL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
        params![
            proposal.id.to_string(),
            proposal.kind.as_str(),
            change,
            proposal.description,
            proposal.source.as_str(),
            proposal.confidence,
            proposal.status.as_str(),
            proposal.decided_by,
            proposal.decided_at.map(|t| t.to_rfc3339()),
            proposal.notes,
            proposal.applied_at.map(|t| t.to_rfc3339()),
            proposal.reverted_at.map(|t| t.to_rfc3339()),
            proposal.created_at.to_rfc3339(),
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

fn get_proposal_on(conn: &Connection, id: Uuid) -> Result<Option<Proposal>> {
    let row = conn
        .query_row(
            &format!("SELECT {PROPOSAL_COLUMNS} FROM proposals WHERE id = ?1"),
            params![id.to_string()],
            ProposalRow::from_row,
        )
        .optional()
        .map_err(store_err)?;
    row.map(ProposalRow::into_proposal).transpose()
}

/// Perform the target-side write for an applied proposal.
fn apply_change_on(conn: &Connection, proposal: &Proposal, at: DateTime<Utc>) -> Result<ApplyOutcome> {
    let outcome = match &proposal.change {
        ProposedChange::AddBoundaryRule { rule } => {
            let inserted = insert_rule_on(conn, &rule.clone().into_rule(at))?;
            ApplyOutcome::RuleAdded {
                rule_id: rule.id,
                inserted,
            }
        }
        ProposedChange::DeactivateBoundaryRule { rule_id } => ApplyOutcome::RuleDeactivated {
            rule_id: *rule_id,
            changed: set_rule_active_on(conn, *rule_id, false)?,
        },
        ProposedChange::UpsertWorkflow { definition } => {
            upsert_definition_on(conn, definition)?;
            ApplyOutcome::WorkflowUpserted {
                name: definition.name.clone(),
            }
        }
        ProposedChange::SetPreference {
            category,
            key,
            value,
            confidence,
        } => {
            let source = format!("proposal:{}", proposal.id);
            set_preference_on(conn, category, key, value, *confidence, &source)?;
            ApplyOutcome::PreferenceSet {
                category: category.clone(),
                key: key.clone(),
            }
        }
        ProposedChange::StepApproval {
            run_id, step_index, ..
        } => ApplyOutcome::StepApprovalConsumed {
            run_id: *run_id,
            step_index: *step_index,
        },
    };
    Ok(outcome)
}

impl ProposalStore for SqliteStore {
    fn insert_proposal(&self, proposal: &Proposal) -> Result<()> {
        insert_proposal_on(&self.db(), proposal)
    }

    fn get_proposal(&self, id: Uuid) -> Result<Option<Proposal>> {
        get_proposal_on(&self.db(), id)
    }

    fn list_proposals(&self, status: Option<ProposalStatus>) -> Result<Vec<Proposal>> {
        let db = self.db();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {PROPOSAL_COLUMNS} FROM proposals
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at, rowid"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![status.map(|s| s.as_str())], ProposalRow::from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(ProposalRow::into_proposal).collect()
    }

    fn record_decision(
        &self,
        id: Uuid,
        from: ProposalStatus,
        to: ProposalStatus,
        decided_by: &str,
        notes: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let db = self.db();
        let changed = db
            .execute(
                "UPDATE proposals SET status = ?3, decided_by = ?4, notes = ?5, decided_at = ?6
                 WHERE id = ?1 AND status = ?2",
                params![
                    id.to_string(),
                    from.as_str(),
                    to.as_str(),
                    decided_by,
                    notes,
                    at.to_rfc3339(),
                ],
            )
            .map_err(store_err)?;
        Ok(changed == 1)
    }

    fn apply_approved(&self, id: Uuid, at: DateTime<Utc>) -> Result<ApplyOutcome> {
        let mut db = self.db();
        let tx = db.transaction().map_err(store_err)?;

        let proposal = get_proposal_on(&tx, id)?.ok_or_else(|| WardenError::not_found("proposal", id))?;

        let already: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM proposal_applications WHERE proposal_id = ?1)",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(store_err)?;
        if already {
            return Err(WardenError::AlreadyApplied(id));
        }
        if proposal.status != ProposalStatus::Approved {
            return Err(WardenError::NotApproved {
                id,
                status: proposal.status.to_string(),
            });
        }

        let claimed = tx
            .execute(
                "INSERT OR IGNORE INTO proposal_applications (proposal_id, applied_at, outcome)
                 VALUES (?1, ?2, '{}')",
                params![id.to_string(), at.to_rfc3339()],
            )
            .map_err(store_err)?;
        if claimed == 0 {
            return Err(WardenError::AlreadyApplied(id));
        }

        let moved = tx
            .execute(
                "UPDATE proposals SET status = 'applied', applied_at = ?2
                 WHERE id = ?1 AND status = 'approved'",
                params![id.to_string(), at.to_rfc3339()],
            )
            .map_err(store_err)?;
        if moved == 0 {
            return Err(WardenError::NotApproved {
                id,
                status: proposal.status.to_string(),
            });
        }

        let outcome = apply_change_on(&tx, &proposal, at)?;
        tx.execute(
            "UPDATE proposal_applications SET outcome = ?2 WHERE proposal_id = ?1",
            params![id.to_string(), serde_json::to_string(&outcome)?],
        )
        .map_err(store_err)?;

        tx.commit().map_err(store_err)?;
        debug!(proposal_id = %id, "proposal application committed");
        Ok(outcome)
    }

    fn revert_applied(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut db = self.db();
        let tx = db.transaction().map_err(store_err)?;

        let proposal = get_proposal_on(&tx, id)?.ok_or_else(|| WardenError::not_found("proposal", id))?;
        let moved = tx
            .execute(
                "UPDATE proposals SET status = 'reverted', reverted_at = ?2
                 WHERE id = ?1 AND status = 'applied'",
                params![id.to_string(), at.to_rfc3339()],
            )
            .map_err(store_err)?;
        if moved == 0 {
            return Ok(false);
        }

        match &proposal.change {
            ProposedChange::AddBoundaryRule { rule } => {
                set_rule_active_on(&tx, rule.id, false)?;
            }
            ProposedChange::DeactivateBoundaryRule { rule_id } => {
                set_rule_active_on(&tx, *rule_id, true)?;
            }
            // Target rollback for the remaining kinds is manual.
            _ => {}
        }

        tx.commit().map_err(store_err)?;
        Ok(true)
    }

    fn proposal_counts(&self) -> Result<Vec<(ProposalStatus, usize)>> {
        let db = self.db();
        let mut stmt = db
            .prepare("SELECT status, COUNT(*) FROM proposals GROUP BY status")
            .map_err(store_err)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter()
            .map(|(status, n)| Ok((status.parse()?, n as usize)))
            .collect()
    }
}
