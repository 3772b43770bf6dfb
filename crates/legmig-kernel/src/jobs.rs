//! Durable job rows backing the ledger queue.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::now_ts;

const JOB_COLUMNS: &str = "id,kind,payload,priority,attempt,available_at,lease_id,leased_until";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRow {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub priority: i32,
    pub attempt: u32,
    /// Epoch millis before which the job is not handed out.
    pub available_at: i64,
    pub lease_id: Option<String>,
    pub leased_until: Option<i64>,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    let payload_s: String = row.get(2)?;
    Ok(JobRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        payload: serde_json::from_str(&payload_s).unwrap_or(serde_json::json!({})),
        priority: row.get(3)?,
        attempt: row.get(4)?,
        available_at: row.get(5)?,
        lease_id: row.get(6)?,
        leased_until: row.get(7)?,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn enqueue_job(
    conn: &Connection,
    id: &str,
    kind: &str,
    payload: &Value,
    priority: i32,
    attempt: u32,
    available_at_ms: i64,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO migration_jobs(id,kind,payload,priority,attempt,available_at,lease_id,leased_until,created)
         VALUES(?,?,?,?,?,?,NULL,NULL,?)",
        params![
            id,
            kind,
            serde_json::to_string(payload)?,
            priority,
            attempt,
            available_at_ms,
            now_ts()
        ],
    )?;
    Ok(())
}

/// Lease the next available job. Jobs whose lease expired are handed out
/// again with their attempt counter bumped.
pub fn lease_next_job(
    conn: &Connection,
    now_ms: i64,
    lease_ttl_ms: i64,
    lease_id: &str,
) -> Result<Option<JobRow>> {
    let sql = format!(
        "UPDATE migration_jobs
            SET lease_id=?1,
                leased_until=?2,
                attempt = attempt + CASE WHEN leased_until IS NULL THEN 0 ELSE 1 END
          WHERE id = (
             SELECT id FROM migration_jobs
              WHERE available_at <= ?3 AND (leased_until IS NULL OR leased_until <= ?3)
              ORDER BY priority ASC, available_at ASC, created ASC
              LIMIT 1
          )
         RETURNING {JOB_COLUMNS}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let job = stmt
        .query_row(
            params![lease_id, now_ms + lease_ttl_ms, now_ms],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

pub fn ack_job(conn: &Connection, lease_id: &str) -> Result<bool> {
    let n = conn.execute("DELETE FROM migration_jobs WHERE lease_id=?", [lease_id])?;
    Ok(n > 0)
}

/// Release a lease and make the job available again at `available_at_ms`.
pub fn nack_job(conn: &Connection, lease_id: &str, available_at_ms: i64) -> Result<bool> {
    let n = conn.execute(
        "UPDATE migration_jobs
            SET attempt=attempt+1, lease_id=NULL, leased_until=NULL, available_at=?
          WHERE lease_id=?",
        params![available_at_ms, lease_id],
    )?;
    Ok(n > 0)
}

/// Queued plus leased jobs.
pub fn count_jobs(conn: &Connection) -> Result<i64> {
    let n: i64 = conn.query_row("SELECT COUNT(1) FROM migration_jobs", [], |row| row.get(0))?;
    Ok(n)
}

const ID_CHUNK: usize = 500;

/// How many of `ids` still wait for a consumer: queued, delayed, or held
/// under an expired lease. Rows leased until after `now_ms` are not counted.
pub fn count_waiting(conn: &Connection, ids: &[String], now_ms: i64) -> Result<i64> {
    let mut total = 0i64;
    for chunk in ids.chunks(ID_CHUNK) {
        let marks = vec!["?"; chunk.len()].join(",");
        let sql = format!(
            "SELECT COUNT(1) FROM migration_jobs
              WHERE (leased_until IS NULL OR leased_until <= ?) AND id IN ({marks})"
        );
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
        args.push(&now_ms);
        for id in chunk {
            args.push(id);
        }
        let n: i64 = conn.query_row(&sql, args.as_slice(), |row| row.get(0))?;
        total += n;
    }
    Ok(total)
}
