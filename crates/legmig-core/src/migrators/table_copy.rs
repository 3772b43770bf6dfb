//! Declarative migrator copying one legacy SQLite table into a table of the
//! ledger database, paged by the legacy integer key.

use anyhow::{anyhow, bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{json, Number, Value};
use std::collections::HashMap;

use crate::config::TableCopyConfig;
use crate::mapping::MappingScope;
use crate::migrator::{HandleParams, MigrationContext, Migrator, Record, ZeroRowPolicy, DEFAULT_GROUP};

pub const DEFAULT_BATCH_SIZE: u32 = 500;
const TARGET_PK: &str = "id";
const NEW_ID_FIELD: &str = "_legmig_pk";

static IDENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("ident regex"));

fn ident(kind: &str, raw: &str) -> Result<String> {
    if IDENT.is_match(raw) {
        Ok(raw.to_string())
    } else {
        bail!("invalid {kind} identifier `{raw}`")
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

#[derive(Debug, Clone)]
pub struct TableCopy {
    name: String,
    description: Option<String>,
    group: String,
    queue_index: Option<u32>,
    connection: Option<String>,
    source_table: String,
    target_table: String,
    id_column: String,
    columns: Option<Vec<String>>,
    batch_size: u32,
    keep_on_running: bool,
    cache_stats: bool,
}

impl TableCopy {
    pub fn from_config(cfg: &TableCopyConfig) -> Result<Self> {
        if cfg.name.trim().is_empty() {
            bail!("table_copy entry without a name");
        }
        let source_table = ident("source table", &cfg.source_table)?;
        let target_table = match &cfg.target_table {
            Some(t) => ident("target table", t)?,
            None => source_table.clone(),
        };
        let id_column = ident("id column", cfg.id_column.as_deref().unwrap_or("id"))?;
        let columns = match &cfg.columns {
            Some(cols) => Some(
                cols.iter()
                    .map(|c| ident("column", c))
                    .collect::<Result<Vec<_>>>()?,
            ),
            None => None,
        };
        Ok(Self {
            name: cfg.name.clone(),
            description: cfg.description.clone(),
            group: cfg.group.clone().unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            queue_index: cfg.queue_index,
            connection: cfg.connection.clone(),
            source_table,
            target_table,
            id_column,
            columns,
            batch_size: cfg.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            keep_on_running: cfg.keep_on_running.unwrap_or(false),
            cache_stats: cfg.cache_stats.unwrap_or(true),
        })
    }

    fn select_list(&self) -> String {
        match &self.columns {
            Some(cols) => std::iter::once(&self.id_column)
                .chain(cols.iter().filter(|c| **c != self.id_column))
                .map(|c| quote(c))
                .collect::<Vec<_>>()
                .join(","),
            None => "*".to_string(),
        }
    }

    fn legacy_id(&self, record: &Record) -> Result<i64> {
        record
            .get(&self.id_column)
            .and_then(Value::as_i64)
            .ok_or_else(|| anyhow!("row without integer `{}`", self.id_column))
    }

    /// Columns written to the target: everything but the legacy key.
    fn data_columns(&self, record: &Record) -> Result<Vec<String>> {
        record
            .keys()
            .filter(|k| **k != self.id_column && k.as_str() != TARGET_PK)
            .map(|k| ident("column", k))
            .collect()
    }

    fn ensure_target(&self, conn: &rusqlite::Connection, columns: &[String]) -> Result<()> {
        let mut defs = vec![format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote(TARGET_PK))];
        defs.extend(columns.iter().map(|c| quote(c)));
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&self.target_table),
            defs.join(", ")
        ))?;
        Ok(())
    }
}

fn json_from_sql(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|x| format!("{x:02x}")).collect()),
    }
}

fn sql_from_json(v: &Value) -> SqlValue {
    match v {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

impl Migrator for TableCopy {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn queue_index(&self) -> Option<u32> {
        self.queue_index
    }

    fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    fn mapping_scope(&self) -> MappingScope {
        MappingScope::new(&self.name, &self.target_table)
    }

    fn zero_row_policy(&self) -> ZeroRowPolicy {
        ZeroRowPolicy {
            keep_on_running: self.keep_on_running,
            keep_on_until_total_size: false,
        }
    }

    fn cache_stats(&self) -> bool {
        self.cache_stats
    }

    fn initial_options(&self) -> Value {
        json!({ "last_id": 0 })
    }

    fn next_options(&self, current: &Value, params: &HandleParams) -> Value {
        let last = params
            .source_data
            .iter()
            .filter_map(|r| r.get(&self.id_column).and_then(Value::as_i64))
            .max();
        match last {
            Some(last_id) => json!({ "last_id": last_id }),
            None => current.clone(),
        }
    }

    fn source_data(&self, ctx: &MigrationContext<'_>) -> Result<Vec<Record>> {
        let last_id = ctx.options().get("last_id").and_then(Value::as_i64).unwrap_or(0);
        let sql = format!(
            "SELECT {} FROM {} WHERE {id} > ?1 ORDER BY {id} LIMIT ?2",
            self.select_list(),
            quote(&self.source_table),
            id = quote(&self.id_column),
        );
        let conn = ctx.source()?;
        let mut stmt = conn
            .prepare(&sql)
            .with_context(|| format!("reading {}", self.source_table))?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let mut rows = stmt.query(rusqlite::params![last_id, self.batch_size])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::new();
            for (idx, name) in names.iter().enumerate() {
                record.insert(name.clone(), json_from_sql(row.get_ref(idx)?));
            }
            out.push(record);
        }
        Ok(out)
    }

    fn handle(&self, ctx: &MigrationContext<'_>, params: &HandleParams) -> Result<()> {
        let Some(first) = params.source_data.first() else {
            return Ok(());
        };
        let columns = self.data_columns(first)?;
        let conn = ctx.ledger();
        self.ensure_target(conn, &columns)?;

        let ids = params
            .source_data
            .iter()
            .map(|r| self.legacy_id(r))
            .collect::<Result<Vec<_>>>()?;
        let existing: HashMap<i64, i64> = ctx
            .lookup_mappings(&ids)?
            .into_iter()
            .filter_map(|m| m.pk_id.map(|pk| (m.legacy_id, pk)))
            .collect();

        let table = quote(&self.target_table);
        let col_list = columns.iter().map(|c| quote(c)).collect::<Vec<_>>();
        let insert_sql = if col_list.is_empty() {
            format!("INSERT INTO {table} DEFAULT VALUES")
        } else {
            let marks = (1..=col_list.len()).map(|i| format!("?{i}")).collect::<Vec<_>>();
            format!("INSERT INTO {table} ({}) VALUES ({})", col_list.join(","), marks.join(","))
        };
        let update_sql = (!col_list.is_empty()).then(|| {
            let sets = col_list
                .iter()
                .enumerate()
                .map(|(i, c)| format!("{c}=?{}", i + 1))
                .collect::<Vec<_>>();
            format!(
                "UPDATE {table} SET {} WHERE {}=?{}",
                sets.join(","),
                quote(TARGET_PK),
                col_list.len() + 1
            )
        });

        let mut mapped = Vec::with_capacity(params.source_data.len());
        for (record, legacy_id) in params.source_data.iter().zip(ids) {
            let mut values: Vec<SqlValue> = columns
                .iter()
                .map(|c| sql_from_json(record.get(c).unwrap_or(&Value::Null)))
                .collect();
            let pk = match existing.get(&legacy_id) {
                Some(pk) => {
                    if let Some(sql) = &update_sql {
                        values.push(SqlValue::Integer(*pk));
                        conn.prepare_cached(sql)?
                            .execute(rusqlite::params_from_iter(values))?;
                    }
                    *pk
                }
                None => {
                    conn.prepare_cached(&insert_sql)?
                        .execute(rusqlite::params_from_iter(values))?;
                    conn.last_insert_rowid()
                }
            };
            let mut with_pk = record.clone();
            with_pk.insert(NEW_ID_FIELD.to_string(), json!(pk));
            mapped.push(with_pk);
        }
        ctx.record_mappings(mapped, &self.id_column, NEW_ID_FIELD)?;
        Ok(())
    }

    fn total_size(&self, ctx: &MigrationContext<'_>) -> Result<i64> {
        let n: i64 = ctx.source()?.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote(&self.source_table)),
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    fn stored_count(&self, ctx: &MigrationContext<'_>, params: &HandleParams) -> Result<Option<i64>> {
        let ids = params
            .source_data
            .iter()
            .map(|r| self.legacy_id(r))
            .collect::<Result<Vec<_>>>()?;
        let stored = ctx
            .lookup_mappings(&ids)?
            .into_iter()
            .filter(|m| m.pk_id.is_some())
            .count();
        Ok(Some(stored as i64))
    }
}
