//! Migration ledger: one row per (migrator, batch) attempt.
//!
//! Every function takes a plain `&Connection` so callers can compose several
//! of them inside one `BEGIN IMMEDIATE` transaction (`Transaction` derefs to
//! `Connection`).

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::{now_ts, RunStatus};

/// Upper bound for stored failure messages, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1024;
pub const TRUNCATION_MARKER: &str = "...";

const RUN_COLUMNS: &str = "id,migrate,status,batch,total_migrated,message,meta,created_at,updated_at";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MigrationRun {
    pub id: i64,
    pub migrate: String,
    pub status: RunStatus,
    pub batch: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_migrated: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl MigrationRun {
    /// Options the migrator should use for this batch.
    pub fn options(&self) -> Option<&Value> {
        self.meta.as_ref()?.get("options").filter(|v| !v.is_null())
    }

    /// Options computed after a successful batch, carried into the next one.
    pub fn next_options(&self) -> Option<&Value> {
        self.meta.as_ref()?.get("next_options").filter(|v| !v.is_null())
    }
}

/// Build the `meta` payload stored on a run row.
pub fn run_meta(options: &Value, next_options: Option<&Value>) -> Value {
    match next_options {
        Some(next) => json!({ "options": options, "next_options": next }),
        None => json!({ "options": options }),
    }
}

/// Clamp a failure message to [`MAX_MESSAGE_CHARS`] characters plus a marker.
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => format!("{}{}", &message[..idx], TRUNCATION_MARKER),
        None => message.to_string(),
    }
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<MigrationRun> {
    let status_s: String = row.get(2)?;
    let status = status_s.parse::<RunStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    let meta = row
        .get::<_, Option<String>>(6)?
        .and_then(|s| serde_json::from_str::<Value>(&s).ok());
    Ok(MigrationRun {
        id: row.get(0)?,
        migrate: row.get(1)?,
        status,
        batch: row.get(3)?,
        total_migrated: row.get(4)?,
        message: row.get(5)?,
        meta,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn select_one(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Option<MigrationRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM migration_runs {filter} LIMIT 1");
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(params, run_from_row).optional()?)
}

fn select_many(
    conn: &Connection,
    filter: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<MigrationRun>> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM migration_runs {filter}");
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params, run_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn get_run(conn: &Connection, id: i64) -> Result<Option<MigrationRun>> {
    select_one(conn, "WHERE id=?", [id])
}

/// Newest row in an active status (pending, ongoing, failed).
pub fn active_run(conn: &Connection, migrate: &str) -> Result<Option<MigrationRun>> {
    select_one(
        conn,
        "WHERE migrate=? AND status IN ('pending','ongoing','failed') ORDER BY batch DESC, id DESC",
        [migrate],
    )
}

pub fn active_runs(conn: &Connection, migrate: &str) -> Result<Vec<MigrationRun>> {
    select_many(
        conn,
        "WHERE migrate=? AND status IN ('pending','ongoing','failed') ORDER BY batch ASC",
        [migrate],
    )
}

pub fn last_success(conn: &Connection, migrate: &str) -> Result<Option<MigrationRun>> {
    select_one(
        conn,
        "WHERE migrate=? AND status='success' ORDER BY batch DESC, id DESC",
        [migrate],
    )
}

/// Highest batch regardless of status.
pub fn latest_run(conn: &Connection, migrate: &str) -> Result<Option<MigrationRun>> {
    select_one(conn, "WHERE migrate=? ORDER BY batch DESC, id DESC", [migrate])
}

pub fn first_run(conn: &Connection, migrate: &str) -> Result<Option<MigrationRun>> {
    select_one(conn, "WHERE migrate=? ORDER BY batch ASC, id ASC", [migrate])
}

pub fn first_restart(conn: &Connection, migrate: &str) -> Result<Option<MigrationRun>> {
    select_one(
        conn,
        "WHERE migrate=? AND status='restart' ORDER BY id ASC",
        [migrate],
    )
}

/// Earliest row that ended the migration, either `done` or `failed`.
pub fn first_terminal(conn: &Connection, migrate: &str) -> Result<Option<MigrationRun>> {
    select_one(
        conn,
        "WHERE migrate=? AND status IN ('done','failed') ORDER BY id ASC",
        [migrate],
    )
}

pub fn list_runs(conn: &Connection, migrate: &str) -> Result<Vec<MigrationRun>> {
    select_many(conn, "WHERE migrate=? ORDER BY batch ASC, id ASC", [migrate])
}

pub fn runs_in_status(conn: &Connection, status: RunStatus) -> Result<Vec<MigrationRun>> {
    select_many(
        conn,
        "WHERE status=? ORDER BY updated_at ASC, id ASC",
        [status.as_str()],
    )
}

/// Insert a pending row for `(migrate, batch)`, or rewrite the existing row
/// with that batch number back to pending. Message and count are cleared.
pub fn upsert_pending(
    conn: &Connection,
    migrate: &str,
    batch: i64,
    meta: &Value,
) -> Result<MigrationRun> {
    let now = now_ts();
    let meta_s = serde_json::to_string(meta)?;
    let sql = format!(
        "INSERT INTO migration_runs(migrate,status,batch,meta,created_at,updated_at)
         VALUES(?1,'pending',?2,?3,?4,?4)
         ON CONFLICT(migrate,batch) DO UPDATE SET
           status='pending',
           meta=excluded.meta,
           message=NULL,
           total_migrated=NULL,
           updated_at=excluded.updated_at
         RETURNING {RUN_COLUMNS}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let run = stmt.query_row(params![migrate, batch, meta_s, now], run_from_row)?;
    Ok(run)
}

pub fn set_status(conn: &Connection, id: i64, status: RunStatus) -> Result<bool> {
    let n = conn.execute(
        "UPDATE migration_runs SET status=?, updated_at=? WHERE id=?",
        params![status.as_str(), now_ts(), id],
    )?;
    Ok(n > 0)
}

pub fn set_pending_with_meta(conn: &Connection, id: i64, meta: &Value) -> Result<bool> {
    let n = conn.execute(
        "UPDATE migration_runs SET status='pending', meta=?, message=NULL, total_migrated=NULL, updated_at=? WHERE id=?",
        params![serde_json::to_string(meta)?, now_ts(), id],
    )?;
    Ok(n > 0)
}

pub fn mark_success(conn: &Connection, id: i64, total_migrated: i64, meta: &Value) -> Result<bool> {
    let n = conn.execute(
        "UPDATE migration_runs SET status='success', total_migrated=?, meta=?, message=NULL, updated_at=? WHERE id=?",
        params![total_migrated, serde_json::to_string(meta)?, now_ts(), id],
    )?;
    Ok(n > 0)
}

/// Mark a row failed; the message is truncated to [`MAX_MESSAGE_CHARS`].
pub fn mark_failed(conn: &Connection, id: i64, message: &str) -> Result<bool> {
    let n = conn.execute(
        "UPDATE migration_runs SET status='failed', message=?, updated_at=? WHERE id=?",
        params![truncate_message(message), now_ts(), id],
    )?;
    Ok(n > 0)
}

pub fn mark_all_restart(conn: &Connection, migrate: &str) -> Result<usize> {
    let n = conn.execute(
        "UPDATE migration_runs SET status='restart', updated_at=? WHERE migrate=?",
        params![now_ts(), migrate],
    )?;
    Ok(n)
}

/// Atomically move one pending row (oldest first) to ongoing and return it.
///
/// The status guard on the outer UPDATE makes this a compare-and-swap: two
/// connections racing for the same row serialise on SQLite's write lock and
/// only the first sees `status='pending'`.
pub fn claim_pending(conn: &Connection) -> Result<Option<MigrationRun>> {
    let sql = format!(
        "UPDATE migration_runs SET status='ongoing', updated_at=?1 WHERE id = (
             SELECT id FROM migration_runs WHERE status='pending' ORDER BY id LIMIT 1
         ) AND status='pending' RETURNING {RUN_COLUMNS}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    Ok(stmt.query_row(params![now_ts()], run_from_row).optional()?)
}

/// Move a specific row to ongoing only if it is still in `expected`.
pub fn reclaim(conn: &Connection, id: i64, expected: RunStatus) -> Result<bool> {
    let n = conn.execute(
        "UPDATE migration_runs SET status='ongoing', updated_at=? WHERE id=? AND status=?",
        params![now_ts(), id, expected.as_str()],
    )?;
    Ok(n > 0)
}

/// Flip every failed row, across all migrators, back to pending.
pub fn retry_failed(conn: &Connection) -> Result<usize> {
    let n = conn.execute(
        "UPDATE migration_runs SET status='pending', message=NULL, updated_at=? WHERE status='failed'",
        params![now_ts()],
    )?;
    Ok(n)
}

pub fn count_by_status(conn: &Connection, migrate: &str) -> Result<BTreeMap<String, i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(1) FROM migration_runs WHERE migrate=? GROUP BY status",
    )?;
    let mut rows = stmt.query([migrate])?;
    let mut out = BTreeMap::new();
    while let Some(r) = rows.next()? {
        out.insert(r.get::<_, String>(0)?, r.get::<_, i64>(1)?);
    }
    Ok(out)
}

/// Sum of `total_migrated` over successful rows.
pub fn sum_success_migrated(conn: &Connection, migrate: &str) -> Result<i64> {
    let n: i64 = conn.query_row(
        "SELECT COALESCE(SUM(total_migrated),0) FROM migration_runs WHERE migrate=? AND status='success'",
        [migrate],
        |row| row.get(0),
    )?;
    Ok(n)
}
