use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;
use warden_core::policy::ALL_CATEGORIES;
use warden_core::{BoundaryRule, PolicyStore, Result};

use crate::store::{SqliteStore, parse_opt_time, parse_time, parse_uuid, store_err};

const RULE_COLUMNS: &str =
    "id, rule_type, category, predicate, effect, description, active, expires_at, created_at";

struct RuleRow {
    id: String,
    rule_type: String,
    category: String,
    predicate: String,
    effect: String,
    description: String,
    active: bool,
    expires_at: Option<String>,
    created_at: String,
}

impl RuleRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            rule_type: row.get(1)?,
            category: row.get(2)?,
            predicate: row.get(3)?,
            effect: row.get(4)?,
            description: row.get(5)?,
            active: row.get::<_, i32>(6)? != 0,
            expires_at: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn into_rule(self) -> Result<BoundaryRule> {
        Ok(BoundaryRule {
            id: parse_uuid(&self.id)?,
            rule_type: self.rule_type.parse()?,
            category: self.category,
            predicate: serde_json::from_str(&self.predicate)?,
            effect: self.effect.parse()?,
            description: self.description,
            active: self.active,
            expires_at: parse_opt_time(self.expires_at)?,
            created_at: parse_time(&self.created_at)?,
        })
    }
}

/// Insert-or-ignore by id. Shared with proposal application.
pub(crate) fn insert_rule_on(conn: &Connection, rule: &BoundaryRule) -> Result<bool> {
    let predicate = serde_json::to_string(&rule.predicate)?;
    let written = conn
        .execute(
            "INSERT OR IGNORE INTO boundary_rules
                (id, rule_type, category, predicate, effect, description, active, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rule.id.to_string(),
                rule.rule_type.as_str(),
                rule.category,
                predicate,
                rule.effect.as_str(),
                rule.description,
                rule.active as i32,
                rule.expires_at.map(|t| t.to_rfc3339()),
                rule.created_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
    Ok(written == 1)
}

pub(crate) fn set_rule_active_on(conn: &Connection, id: Uuid, active: bool) -> Result<bool> {
    let changed = conn
        .execute(
            "UPDATE boundary_rules SET active = ?2 WHERE id = ?1 AND active != ?2",
            params![id.to_string(), active as i32],
        )
        .map_err(store_err)?;
    Ok(changed == 1)
}

fn collect_rules(rows: Vec<RuleRow>) -> Result<Vec<BoundaryRule>> {
    rows.into_iter().map(RuleRow::into_rule).collect()
}

impl PolicyStore for SqliteStore {
    fn active_rules(&self, category: &str) -> Result<Vec<BoundaryRule>> {
        let db = self.db();
        let mut stmt = db
            .prepare(&format!(
                "SELECT {RULE_COLUMNS} FROM boundary_rules
                 WHERE active = 1 AND (category = ?1 OR category = ?2)
                 ORDER BY created_at"
            ))
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![category, ALL_CATEGORIES], RuleRow::from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        collect_rules(rows)
    }

    fn insert_rule(&self, rule: &BoundaryRule) -> Result<bool> {
        insert_rule_on(&self.db(), rule)
    }

    fn set_rule_active(&self, id: Uuid, active: bool) -> Result<bool> {
        set_rule_active_on(&self.db(), id, active)
    }

    fn get_rule(&self, id: Uuid) -> Result<Option<BoundaryRule>> {
        let db = self.db();
        let row = db
            .query_row(
                &format!("SELECT {RULE_COLUMNS} FROM boundary_rules WHERE id = ?1"),
                params![id.to_string()],
                RuleRow::from_row,
            )
            .optional()
            .map_err(store_err)?;
        row.map(RuleRow::into_rule).transpose()
    }

    fn list_rules(&self, include_inactive: bool) -> Result<Vec<BoundaryRule>> {
        let db = self.db();
        let sql = if include_inactive {
            format!("SELECT {RULE_COLUMNS} FROM boundary_rules ORDER BY created_at")
        } else {
            format!("SELECT {RULE_COLUMNS} FROM boundary_rules WHERE active = 1 ORDER BY created_at")
        };
        let mut stmt = db.prepare(&sql).map_err(store_err)?;
        let rows = stmt
            .query_map([], RuleRow::from_row)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        collect_rules(rows)
    }
}
