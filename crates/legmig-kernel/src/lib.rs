use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};

pub mod jobs;
pub mod mappings;
pub mod runs;
mod status;

pub use jobs::JobRow;
pub use mappings::{LegacyMapping, MappingRow};
pub use runs::{truncate_message, MigrationRun, MAX_MESSAGE_CHARS, TRUNCATION_MARKER};
pub use status::RunStatus;

/// Handle to the ledger database. Cheap to clone; every operation opens its
/// own connection so the handle can move freely into blocking tasks.
#[derive(Clone, Debug)]
pub struct Kernel {
    db_path: PathBuf,
}

pub(crate) fn now_ts() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

impl Kernel {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let kernel = Self {
            db_path: db_path.to_path_buf(),
        };
        let conn = kernel.connect()?;
        // WAL lets readers (stats, CLI) proceed while a batch holds the write lock
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::init_schema(&conn)?;
        tracing::debug!(path = %kernel.db_path.display(), "ledger opened");
        Ok(kernel)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Migration ledger: one row per (migrator, batch) attempt
            CREATE TABLE IF NOT EXISTS migration_runs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              migrate TEXT NOT NULL,
              status TEXT NOT NULL,
              batch INTEGER NOT NULL DEFAULT 1,
              total_migrated INTEGER,     -- set on success only
              message TEXT,               -- truncated failure note
              meta TEXT,                  -- JSON: {"options":..,"next_options":..}
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_runs_migrate ON migration_runs(migrate);
            CREATE INDEX IF NOT EXISTS idx_runs_status ON migration_runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_batch ON migration_runs(batch);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_runs_migrate_batch ON migration_runs(migrate, batch);

            -- Record mapping ledger: legacy identity -> new-system identity
            CREATE TABLE IF NOT EXISTS legacy_mappings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              source_name TEXT NOT NULL,
              legacy_id INTEGER NOT NULL,
              pk_id INTEGER,
              migration_table_name TEXT NOT NULL,
              meta TEXT,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mappings_pk ON legacy_mappings(pk_id);
            CREATE INDEX IF NOT EXISTS idx_mappings_table ON legacy_mappings(migration_table_name);
            CREATE UNIQUE INDEX IF NOT EXISTS ml_unique
              ON legacy_mappings(source_name, legacy_id, migration_table_name);

            -- Durable job queue for batch execution
            CREATE TABLE IF NOT EXISTS migration_jobs (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              payload TEXT NOT NULL,
              priority INTEGER NOT NULL DEFAULT 0,
              attempt INTEGER NOT NULL DEFAULT 0,
              available_at INTEGER NOT NULL,  -- epoch millis
              lease_id TEXT,
              leased_until INTEGER,           -- epoch millis
              created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_available ON migration_jobs(available_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_lease ON migration_jobs(lease_id);

            -- Small operator key/value store (e.g. last migrator acted on)
            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Open a fresh connection with busy timeout and cache tuning applied.
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        // Busy timeout (default 5000ms; override with LEGMIG_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("LEGMIG_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        conn.busy_timeout(std::time::Duration::from_millis(busy_ms))?;
        // Cache size: negative = KB units
        let cache_pages: i64 = std::env::var("LEGMIG_SQLITE_CACHE_PAGES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-20000);
        let _ = conn.pragma_update(None, "cache_size", cache_pages);
        Ok(conn)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction on a fresh connection.
    /// Commits on `Ok`, rolls back on `Err`.
    pub fn write_tx<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> std::result::Result<T, E>,
        E: From<rusqlite::Error> + From<anyhow::Error>,
    {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    pub fn claim_pending_run(&self) -> Result<Option<MigrationRun>> {
        self.write_tx(|tx| runs::claim_pending(tx))
    }

    pub fn retry_failed_runs(&self) -> Result<usize> {
        let conn = self.connect()?;
        runs::retry_failed(&conn)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<MigrationRun>> {
        let conn = self.connect()?;
        runs::get_run(&conn, id)
    }

    pub fn list_runs(&self, migrate: &str) -> Result<Vec<MigrationRun>> {
        let conn = self.connect()?;
        runs::list_runs(&conn, migrate)
    }

    pub fn runs_in_status(&self, status: RunStatus) -> Result<Vec<MigrationRun>> {
        let conn = self.connect()?;
        runs::runs_in_status(&conn, status)
    }

    pub fn reclaim_run(&self, id: i64, expected: RunStatus) -> Result<bool> {
        self.write_tx(|tx| runs::reclaim(tx, id, expected))
    }

    pub fn mark_run_failed(&self, id: i64, message: &str) -> Result<bool> {
        let conn = self.connect()?;
        runs::mark_failed(&conn, id, message)
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let v = conn
            .query_row("SELECT value FROM settings WHERE key=?", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(v)
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO settings(key,value,updated) VALUES(?1,?2,?3)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value, updated=excluded.updated",
            params![key, value, now_ts()],
        )?;
        Ok(())
    }

    pub fn enqueue_job(
        &self,
        id: &str,
        kind: &str,
        payload: &serde_json::Value,
        priority: i32,
        attempt: u32,
        available_at_ms: i64,
    ) -> Result<()> {
        let conn = self.connect()?;
        jobs::enqueue_job(&conn, id, kind, payload, priority, attempt, available_at_ms)
    }

    pub fn lease_next_job(
        &self,
        now_ms: i64,
        lease_ttl_ms: i64,
        lease_id: &str,
    ) -> Result<Option<JobRow>> {
        self.write_tx(|tx| jobs::lease_next_job(tx, now_ms, lease_ttl_ms, lease_id))
    }

    pub fn ack_job(&self, lease_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        jobs::ack_job(&conn, lease_id)
    }

    pub fn nack_job(&self, lease_id: &str, available_at_ms: i64) -> Result<bool> {
        let conn = self.connect()?;
        jobs::nack_job(&conn, lease_id, available_at_ms)
    }

    pub fn count_jobs(&self) -> Result<i64> {
        let conn = self.connect()?;
        jobs::count_jobs(&conn)
    }

    pub fn count_waiting_jobs(&self, ids: &[String], now_ms: i64) -> Result<i64> {
        let conn = self.connect()?;
        jobs::count_waiting(&conn, ids, now_ms)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn claim_pending_run_async(&self) -> Result<Option<MigrationRun>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.claim_pending_run())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn reclaim_run_async(&self, id: i64, expected: RunStatus) -> Result<bool> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.reclaim_run(id, expected))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn mark_run_failed_async(&self, id: i64, message: &str) -> Result<bool> {
        let k = self.clone();
        let msg = message.to_string();
        tokio::task::spawn_blocking(move || k.mark_run_failed(id, &msg))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn enqueue_job_async(
        &self,
        id: &str,
        kind: &str,
        payload: &serde_json::Value,
        priority: i32,
        attempt: u32,
        available_at_ms: i64,
    ) -> Result<()> {
        let k = self.clone();
        let id = id.to_string();
        let kind = kind.to_string();
        let payload = payload.clone();
        tokio::task::spawn_blocking(move || {
            k.enqueue_job(&id, &kind, &payload, priority, attempt, available_at_ms)
        })
        .await
        .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn lease_next_job_async(
        &self,
        now_ms: i64,
        lease_ttl_ms: i64,
        lease_id: &str,
    ) -> Result<Option<JobRow>> {
        let k = self.clone();
        let lease_id = lease_id.to_string();
        tokio::task::spawn_blocking(move || k.lease_next_job(now_ms, lease_ttl_ms, &lease_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn ack_job_async(&self, lease_id: &str) -> Result<bool> {
        let k = self.clone();
        let lease_id = lease_id.to_string();
        tokio::task::spawn_blocking(move || k.ack_job(&lease_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn nack_job_async(&self, lease_id: &str, available_at_ms: i64) -> Result<bool> {
        let k = self.clone();
        let lease_id = lease_id.to_string();
        tokio::task::spawn_blocking(move || k.nack_job(&lease_id, available_at_ms))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn count_jobs_async(&self) -> Result<i64> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.count_jobs())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn count_waiting_jobs_async(&self, ids: Vec<String>, now_ms: i64) -> Result<i64> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.count_waiting_jobs(&ids, now_ms))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}
