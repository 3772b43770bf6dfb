//! Record mapping helpers layered over the ledger's `legacy_mappings` table.

use anyhow::{anyhow, Result};
use legmig_kernel::{mappings, LegacyMapping, MappingRow};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::migrator::Record;

/// Logical scope a mapping row belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingScope {
    pub source_name: String,
    pub table_name: String,
}

impl MappingScope {
    pub fn new(source_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            table_name: table_name.into(),
        }
    }
}

fn id_from_value(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Upsert one mapping per record and hand the records back without the
/// legacy id field. Duplicate legacy ids in one call collapse into one row
/// carrying the last `new_id_field` value.
pub fn record_mappings(
    conn: &Connection,
    scope: &MappingScope,
    records: Vec<Record>,
    legacy_id_field: &str,
    new_id_field: &str,
) -> Result<Vec<Record>> {
    let mut rows = Vec::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        let legacy_id = record
            .get(legacy_id_field)
            .and_then(id_from_value)
            .ok_or_else(|| {
                anyhow!("record {idx} has no integer legacy id in field `{legacy_id_field}`")
            })?;
        rows.push(LegacyMapping {
            source_name: scope.source_name.clone(),
            legacy_id,
            pk_id: record.get(new_id_field).and_then(id_from_value),
            migration_table_name: scope.table_name.clone(),
        });
    }
    mappings::upsert_mappings(conn, &rows)?;
    Ok(records
        .into_iter()
        .map(|mut record| {
            record.remove(legacy_id_field);
            record
        })
        .collect())
}

pub fn count_mapped(conn: &Connection, scope: &MappingScope) -> Result<i64> {
    mappings::count_mapped(conn, &scope.source_name, &scope.table_name)
}

pub fn lookup_mappings(
    conn: &Connection,
    scope: &MappingScope,
    legacy_ids: &[i64],
) -> Result<Vec<MappingRow>> {
    mappings::lookup_mappings(conn, &scope.source_name, &scope.table_name, legacy_ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use legmig_kernel::Kernel;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn strips_legacy_field_and_upserts() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(&dir.path().join("l.sqlite")).unwrap();
        let conn = kernel.connect().unwrap();
        let scope = MappingScope::new("users", "accounts");

        let out = record_mappings(
            &conn,
            &scope,
            vec![
                rec(json!({"old_id": 1, "id": 10, "name": "a"})),
                rec(json!({"old_id": "2", "id": null, "name": "b"})),
            ],
            "old_id",
            "id",
        )
        .unwrap();
        assert!(out.iter().all(|r| !r.contains_key("old_id")));
        assert_eq!(out[0]["name"], json!("a"));

        let rows = lookup_mappings(&conn, &scope, &[1, 2]).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].pk_id, Some(10));
        assert_eq!(rows[1].pk_id, None);
        assert_eq!(count_mapped(&conn, &scope).unwrap(), 2);
    }

    #[test]
    fn missing_legacy_id_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(&dir.path().join("l.sqlite")).unwrap();
        let conn = kernel.connect().unwrap();
        let scope = MappingScope::new("users", "users");
        let err = record_mappings(
            &conn,
            &scope,
            vec![rec(json!({"old_id": 1})), rec(json!({"name": "x"}))],
            "old_id",
            "id",
        )
        .unwrap_err();
        assert!(err.to_string().contains("record 1"));
        assert_eq!(count_mapped(&conn, &scope).unwrap(), 0);
    }
}
