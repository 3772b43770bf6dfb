//! Record mapping ledger: `(source_name, legacy_id, migration_table_name)` to
//! the identity assigned in the new system.

use anyhow::Result;
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_ts;

/// SQLite's default host-parameter limit is far above this; chunking keeps
/// statements small for large batches.
const LOOKUP_CHUNK: usize = 500;

/// Mapping to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyMapping {
    pub source_name: String,
    pub legacy_id: i64,
    pub pk_id: Option<i64>,
    pub migration_table_name: String,
}

/// Mapping as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRow {
    pub id: i64,
    pub source_name: String,
    pub legacy_id: i64,
    pub pk_id: Option<i64>,
    pub migration_table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<MappingRow> {
    Ok(MappingRow {
        id: row.get(0)?,
        source_name: row.get(1)?,
        legacy_id: row.get(2)?,
        pk_id: row.get(3)?,
        migration_table_name: row.get(4)?,
        meta: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Insert new mappings; on a uniqueness conflict only `pk_id` moves.
pub fn upsert_mappings(conn: &Connection, rows: &[LegacyMapping]) -> Result<usize> {
    if rows.is_empty() {
        return Ok(0);
    }
    let now = now_ts();
    let mut stmt = conn.prepare_cached(
        "INSERT INTO legacy_mappings(source_name,legacy_id,pk_id,migration_table_name,created_at,updated_at)
         VALUES(?1,?2,?3,?4,?5,?5)
         ON CONFLICT(source_name,legacy_id,migration_table_name) DO UPDATE SET
           pk_id=excluded.pk_id,
           updated_at=excluded.updated_at",
    )?;
    let mut written = 0usize;
    for m in rows {
        written += stmt.execute(params![
            m.source_name,
            m.legacy_id,
            m.pk_id,
            m.migration_table_name,
            now
        ])?;
    }
    Ok(written)
}

pub fn count_mapped(conn: &Connection, source_name: &str, table_name: &str) -> Result<i64> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(1) FROM legacy_mappings WHERE source_name=? AND migration_table_name=?",
        params![source_name, table_name],
        |row| row.get(0),
    )?;
    Ok(n)
}

/// Bulk lookup by legacy id within one source/table scope.
pub fn lookup_mappings(
    conn: &Connection,
    source_name: &str,
    table_name: &str,
    legacy_ids: &[i64],
) -> Result<Vec<MappingRow>> {
    let mut out = Vec::with_capacity(legacy_ids.len());
    for chunk in legacy_ids.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT id,source_name,legacy_id,pk_id,migration_table_name,meta,created_at,updated_at
             FROM legacy_mappings
             WHERE source_name=? AND migration_table_name=? AND legacy_id IN ({placeholders})
             ORDER BY legacy_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut bound: Vec<rusqlite::types::Value> = Vec::with_capacity(chunk.len() + 2);
        bound.push(source_name.to_string().into());
        bound.push(table_name.to_string().into());
        bound.extend(chunk.iter().map(|id| rusqlite::types::Value::Integer(*id)));
        let rows = stmt
            .query_map(params_from_iter(bound), mapping_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        out.extend(rows);
    }
    Ok(out)
}

pub fn list_mappings(
    conn: &Connection,
    source_name: &str,
    table_name: &str,
) -> Result<Vec<MappingRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id,source_name,legacy_id,pk_id,migration_table_name,meta,created_at,updated_at
         FROM legacy_mappings WHERE source_name=? AND migration_table_name=? ORDER BY legacy_id ASC",
    )?;
    let rows = stmt
        .query_map(params![source_name, table_name], mapping_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
