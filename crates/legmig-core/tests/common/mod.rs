#![allow(dead_code)]

use anyhow::bail;
use legmig_core::{
    BatchStateMachine, HandleParams, Kernel, MigrationContext, Migrator, Record, SourceConnections,
    ZeroRowPolicy,
};
use legmig_kernel::runs;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

pub fn open() -> (TempDir, BatchStateMachine) {
    let dir = tempfile::tempdir().expect("tmpdir");
    let kernel = Kernel::open(&dir.path().join("ledger.sqlite")).expect("open ledger");
    (dir, BatchStateMachine::new(kernel, SourceConnections::new()))
}

/// In-memory migrator paging through a list of legacy ids with an offset
/// cursor kept in the run options.
pub struct Scripted {
    pub name: String,
    pub rows: Mutex<Vec<i64>>,
    pub page: usize,
    pub policy: ZeroRowPolicy,
    pub total: Option<i64>,
    pub stored_override: Option<i64>,
    pub fail_times: AtomicU32,
    pub restartable: bool,
    pub cached: bool,
    pub size_calls: AtomicU32,
}

impl Scripted {
    pub fn new(name: &str, rows: impl IntoIterator<Item = i64>, page: usize) -> Self {
        Self {
            name: name.to_string(),
            rows: Mutex::new(rows.into_iter().collect()),
            page,
            policy: ZeroRowPolicy::default(),
            total: None,
            stored_override: None,
            fail_times: AtomicU32::new(0),
            restartable: true,
            cached: true,
            size_calls: AtomicU32::new(0),
        }
    }

    pub fn failing(self, times: u32) -> Self {
        self.fail_times.store(times, Ordering::SeqCst);
        self
    }

    fn offset(options: &Value) -> usize {
        options.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize
    }
}

impl Migrator for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn zero_row_policy(&self) -> ZeroRowPolicy {
        self.policy
    }

    fn cache_stats(&self) -> bool {
        self.cached
    }

    fn allow_restart(&self) -> bool {
        self.restartable
    }

    fn initial_options(&self) -> Value {
        json!({ "offset": 0 })
    }

    fn next_options(&self, current: &Value, params: &HandleParams) -> Value {
        json!({ "offset": Self::offset(current) + params.size as usize })
    }

    fn source_data(&self, ctx: &MigrationContext<'_>) -> anyhow::Result<Vec<Record>> {
        let offset = Self::offset(ctx.options());
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .skip(offset)
            .take(self.page)
            .map(|id| {
                json!({ "legacy_id": id, "new_id": id * 10, "name": format!("row {id}") })
                    .as_object()
                    .cloned()
                    .unwrap_or_default()
            })
            .collect())
    }

    fn handle(&self, ctx: &MigrationContext<'_>, params: &HandleParams) -> anyhow::Result<()> {
        ctx.record_mappings(params.source_data.clone(), "legacy_id", "new_id")?;
        if self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            bail!("transient boom");
        }
        Ok(())
    }

    fn total_size(&self, _ctx: &MigrationContext<'_>) -> anyhow::Result<i64> {
        self.size_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.total.unwrap_or_else(|| self.rows.lock().len() as i64))
    }

    fn stored_count(
        &self,
        ctx: &MigrationContext<'_>,
        params: &HandleParams,
    ) -> anyhow::Result<Option<i64>> {
        if let Some(n) = self.stored_override {
            return Ok(Some(n));
        }
        let ids: Vec<i64> = params
            .source_data
            .iter()
            .filter_map(|r| r.get("legacy_id").and_then(Value::as_i64))
            .collect();
        Ok(Some(ctx.lookup_mappings(&ids)?.len() as i64))
    }
}

/// Claim the next pending row (must be `name`'s) and run it.
pub fn claim_and_run(
    machine: &BatchStateMachine,
    m: &dyn Migrator,
) -> Result<legmig_core::RunOutcome, legmig_core::MigrationError> {
    let run = machine
        .kernel()
        .claim_pending_run()
        .expect("claim")
        .expect("a pending row");
    assert_eq!(run.migrate, m.name());
    machine.run(m, run.id)
}

pub fn assert_at_most_one_active(machine: &BatchStateMachine, name: &str) {
    let conn = machine.kernel().connect().unwrap();
    let active = runs::active_runs(&conn, name).unwrap();
    assert!(active.len() <= 1, "more than one active row: {active:?}");
}

pub fn statuses(machine: &BatchStateMachine, name: &str) -> Vec<(i64, String)> {
    machine
        .kernel()
        .list_runs(name)
        .unwrap()
        .into_iter()
        .map(|r| (r.batch, r.status.to_string()))
        .collect()
}
