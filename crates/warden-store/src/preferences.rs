use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use uuid::Uuid;
use warden_core::{Entity, EntityStore, Preference, PreferenceStore, Result};

use crate::store::{SqliteStore, parse_time, parse_uuid, store_err};

/// Upsert by `(category, key)`. Shared with proposal application.
pub(crate) fn set_preference_on(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &Value,
    confidence: f64,
    source: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO preferences (category, key, value, confidence, source, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(category, key) DO UPDATE SET
            value = excluded.value,
            confidence = excluded.confidence,
            source = excluded.source,
            updated_at = excluded.updated_at",
        params![
            category,
            key,
            value.to_string(),
            confidence,
            source,
            Utc::now().to_rfc3339(),
        ],
    )
    .map_err(store_err)?;
    Ok(())
}

type PreferenceRow = (String, String, String, f64, String, String);

fn preference_from(row: PreferenceRow) -> Result<Preference> {
    let (category, key, value, confidence, source, updated_at) = row;
    Ok(Preference {
        category,
        key,
        value: serde_json::from_str(&value)?,
        confidence,
        source,
        updated_at: parse_time(&updated_at)?,
    })
}

fn read_preference(row: &rusqlite::Row<'_>) -> rusqlite::Result<PreferenceRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

impl PreferenceStore for SqliteStore {
    fn set_preference(
        &self,
        category: &str,
        key: &str,
        value: &Value,
        confidence: f64,
        source: &str,
    ) -> Result<()> {
        set_preference_on(&self.db(), category, key, value, confidence, source)
    }

    fn get_preference(&self, category: &str, key: &str) -> Result<Option<Preference>> {
        let db = self.db();
        let row = db
            .query_row(
                "SELECT category, key, value, confidence, source, updated_at
                 FROM preferences WHERE category = ?1 AND key = ?2",
                params![category, key],
                read_preference,
            )
            .optional()
            .map_err(store_err)?;
        row.map(preference_from).transpose()
    }

    fn list_preferences(&self, category: Option<&str>) -> Result<Vec<Preference>> {
        let db = self.db();
        let mut stmt = db
            .prepare(
                "SELECT category, key, value, confidence, source, updated_at
                 FROM preferences
                 WHERE ?1 IS NULL OR category = ?1
                 ORDER BY category, key",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![category], read_preference)
            .map_err(store_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(store_err)?;
        rows.into_iter().map(preference_from).collect()
    }
}

impl EntityStore for SqliteStore {
    fn create_entity(&self, kind: &str, name: &str, data: &Value) -> Result<Entity> {
        let entity = Entity {
            id: Uuid::new_v4(),
            kind: kind.to_string(),
            name: name.to_string(),
            data: data.clone(),
            created_at: Utc::now(),
        };
        let db = self.db();
        db.execute(
            "INSERT INTO entities (id, kind, name, data, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entity.id.to_string(),
                entity.kind,
                entity.name,
                entity.data.to_string(),
                entity.created_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
        Ok(entity)
    }

    fn query_entities(
        &self,
        kind: &str,
        name_contains: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Entity>> {
        let pattern = name_contains.map(|n| format!("%{}%", n.to_lowercase()));
        let db = self.db();
        let mut stmt = db
            .prepare(
                "SELECT id, kind, name, data, created_at FROM entities
                 WHERE kind = ?1 AND (?2 IS NULL OR lower(name) LIKE ?2)
                 ORDER BY created_at DESC
                 LIMIT ?3",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![kind, pattern, limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
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
            .map(|(id, kind, name, data, created_at)| {
                Ok(Entity {
                    id: parse_uuid(&id)?,
                    kind,
                    name,
                    data: serde_json::from_str(&data)?,
                    created_at: parse_time(&created_at)?,
                })
            })
            .collect()
    }
}
