//! Batch state machine: the only writer of `migration_runs` transitions.
//!
//! ```text
//! (none) --create_pending--> pending --claim--> ongoing
//! ongoing --rows--> success --spawn--> pending
//! ongoing --no rows, keep_on_until_total_size, remaining>0--> success --spawn--> pending
//! ongoing --no rows, keep_on_running--> pending
//! ongoing --no rows--> done
//! ongoing --error--> failed --retry--> pending
//! any --restart--> restart (earliest batch back to pending)
//! any --pause--> paused, newest --resume--> pending
//! ```

use legmig_kernel::runs::{self, run_meta};
use legmig_kernel::{Kernel, MigrationRun, RunStatus};
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::error::MigrationError;
use crate::migrator::{HandleParams, MigrationContext, Migrator};
use crate::source::SourceConnections;

pub type Result<T> = std::result::Result<T, MigrationError>;

/// How one executed batch ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Rows were handled; `next` is the batch spawned after it.
    Success {
        run_id: i64,
        batch: i64,
        migrated: i64,
        next: MigrationRun,
    },
    /// No rows, but the migrator keeps polling.
    KeptPending { run_id: i64, batch: i64 },
    /// No rows and nothing left to do.
    Done { run_id: i64, batch: i64 },
}

/// Progress figures for one migrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MigrationStats {
    pub total_size: i64,
    pub actual_migrated: i64,
    pub total_migrated: i64,
    pub remaining: i64,
    pub status_counts: BTreeMap<String, i64>,
}

/// `max(total_size - max(actual, total_migrated), 0)`.
pub fn remaining(total_size: i64, actual_migrated: i64, total_migrated: i64) -> i64 {
    (total_size - actual_migrated.max(total_migrated)).max(0)
}

#[derive(Clone, Debug)]
pub struct BatchStateMachine {
    kernel: Kernel,
    sources: SourceConnections,
}

impl BatchStateMachine {
    pub fn new(kernel: Kernel, sources: SourceConnections) -> Self {
        Self { kernel, sources }
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn sources(&self) -> &SourceConnections {
        &self.sources
    }

    /// Open the next batch after the last successful one.
    pub fn create_pending(&self, m: &dyn Migrator) -> Result<MigrationRun> {
        let name = m.name();
        self.kernel.write_tx(|tx| {
            if let Some(active) = runs::active_run(tx, name)? {
                return Err(MigrationError::Conflict {
                    migrator: name.to_string(),
                    status: active.status,
                    batch: active.batch,
                });
            }
            let last = runs::last_success(tx, name)?;
            let batch = last.as_ref().map(|r| r.batch + 1).unwrap_or(1);
            let options = last
                .as_ref()
                .and_then(|r| r.next_options().or_else(|| r.options()).cloned())
                .unwrap_or_else(|| m.initial_options());
            let run = runs::upsert_pending(tx, name, batch, &run_meta(&options, None))?;
            info!(migrator = %name, batch, run_id = run.id, "pending batch created");
            Ok(run)
        })
    }

    /// Execute one claimed (`ongoing`) batch in a single write transaction.
    /// Any error rolls the batch back, marks the row failed and is returned.
    pub fn run(&self, m: &dyn Migrator, run_id: i64) -> Result<RunOutcome> {
        match self.kernel.write_tx(|tx| self.execute(tx, m, run_id)) {
            Ok(outcome) => Ok(outcome),
            Err(err @ (MigrationError::NotClaimed { .. } | MigrationError::NotFound(_))) => {
                warn!(migrator = %m.name(), run_id, error = %err, "batch skipped");
                Err(err)
            }
            Err(err) => {
                let message = err.to_string();
                match self.kernel.mark_run_failed(run_id, &message) {
                    Ok(_) => {}
                    Err(mark_err) => {
                        error!(migrator = %m.name(), run_id, error = %mark_err, "could not mark run failed")
                    }
                }
                error!(
                    migrator = %m.name(),
                    run_id,
                    error = %legmig_kernel::truncate_message(&message),
                    "migration failed"
                );
                Err(err)
            }
        }
    }

    fn execute(&self, tx: &Transaction<'_>, m: &dyn Migrator, run_id: i64) -> Result<RunOutcome> {
        let name = m.name();
        let run = runs::get_run(tx, run_id)?
            .ok_or_else(|| MigrationError::NotFound(format!("run {run_id}")))?;
        if run.status != RunStatus::Ongoing {
            return Err(MigrationError::NotClaimed {
                run_id,
                status: run.status,
            });
        }
        info!(migrator = %name, batch = run.batch, run_id, "migration started");

        let options = run.options().cloned().unwrap_or_else(|| m.initial_options());
        let ctx = MigrationContext::new(tx, &self.sources, m, options.clone(), run.batch);
        let records = m.source_data(&ctx).map_err(MigrationError::Execution)?;
        let size = records.len() as i64;

        let policy = m.zero_row_policy();
        let keep_until_total =
            policy.keep_on_until_total_size && self.remaining_in(tx, &ctx, m)? > 0;

        if size > 0 || keep_until_total {
            let params = HandleParams {
                source_data: records,
                size,
                options: options.clone(),
            };
            m.handle(&ctx, &params).map_err(MigrationError::Execution)?;
            if let Some(stored) = m
                .stored_count(&ctx, &params)
                .map_err(MigrationError::Execution)?
            {
                if stored != size {
                    return Err(MigrationError::CountMismatch {
                        source_count: size,
                        stored_count: stored,
                    });
                }
            }
            let next_options = m.next_options(&options, &params);
            runs::mark_success(tx, run.id, size, &run_meta(&options, Some(&next_options)))?;
            let next = spawn_next(tx, name, &run, &next_options)?;
            info!(
                migrator = %name,
                batch = run.batch,
                run_id,
                migrated = size,
                next_batch = next.batch,
                "migration succeeded"
            );
            Ok(RunOutcome::Success {
                run_id,
                batch: run.batch,
                migrated: size,
                next,
            })
        } else if policy.keep_on_running {
            runs::set_status(tx, run.id, RunStatus::Pending)?;
            info!(migrator = %name, batch = run.batch, run_id, "no rows, kept pending");
            Ok(RunOutcome::KeptPending {
                run_id,
                batch: run.batch,
            })
        } else {
            runs::set_status(tx, run.id, RunStatus::Done)?;
            info!(migrator = %name, batch = run.batch, run_id, "migration done");
            Ok(RunOutcome::Done {
                run_id,
                batch: run.batch,
            })
        }
    }

    fn remaining_in(
        &self,
        conn: &Connection,
        ctx: &MigrationContext<'_>,
        m: &dyn Migrator,
    ) -> Result<i64> {
        let total_size = m.total_size(ctx).map_err(MigrationError::Execution)?;
        let actual = m.actual_migrated(ctx).map_err(MigrationError::Execution)?;
        let total_migrated = runs::sum_success_migrated(conn, m.name())?;
        Ok(remaining(total_size, actual, total_migrated))
    }

    /// Mark every row `restart` and put the earliest batch back to pending
    /// with fresh options. Returns the number of rows touched.
    pub fn restart(&self, m: &dyn Migrator) -> Result<usize> {
        let name = m.name();
        if !m.allow_restart() {
            return Err(MigrationError::RestartRefused(name.to_string()));
        }
        self.kernel.write_tx(|tx| {
            let count = runs::mark_all_restart(tx, name)?;
            if let Some(first) = runs::first_run(tx, name)? {
                runs::set_pending_with_meta(tx, first.id, &run_meta(&m.initial_options(), None))?;
                info!(migrator = %name, count, batch = first.batch, "migration restarted");
            }
            Ok(count)
        })
    }

    /// Put the newest row back to pending.
    pub fn resume(&self, name: &str) -> Result<MigrationRun> {
        self.kernel.write_tx(|tx| {
            let latest = runs::latest_run(tx, name)?
                .ok_or_else(|| MigrationError::NotFound(format!("no runs for [{name}]")))?;
            if let Some(other) = runs::active_runs(tx, name)?
                .into_iter()
                .find(|r| r.id != latest.id)
            {
                return Err(MigrationError::Conflict {
                    migrator: name.to_string(),
                    status: other.status,
                    batch: other.batch,
                });
            }
            runs::set_status(tx, latest.id, RunStatus::Pending)?;
            info!(migrator = %name, batch = latest.batch, run_id = latest.id, "migration resumed");
            fetch(tx, latest.id)
        })
    }

    /// Pause the newest active row, or the newest row when none is active.
    pub fn pause(&self, name: &str) -> Result<MigrationRun> {
        self.kernel.write_tx(|tx| {
            let target = match runs::active_run(tx, name)? {
                Some(run) => run,
                None => runs::latest_run(tx, name)?
                    .ok_or_else(|| MigrationError::NotFound(format!("no runs for [{name}]")))?,
            };
            runs::set_status(tx, target.id, RunStatus::Paused)?;
            info!(migrator = %name, batch = target.batch, run_id = target.id, "migration paused");
            fetch(tx, target.id)
        })
    }

    /// Flip every failed row, across all migrators, back to pending.
    pub fn retry_failed(&self) -> Result<usize> {
        let count = self.kernel.retry_failed_runs()?;
        info!(count, "failed migrations set to pending");
        Ok(count)
    }

    /// First row that ended the migration (`done` or `failed`), if any.
    pub fn should_terminate(&self, name: &str) -> Result<Option<MigrationRun>> {
        let conn = self.kernel.connect()?;
        Ok(runs::first_terminal(&conn, name)?)
    }

    /// Compute progress without any caching.
    pub fn stats(&self, m: &dyn Migrator) -> Result<MigrationStats> {
        let conn = self.kernel.connect()?;
        let ctx = self.read_context(&conn, m)?;
        let total_size = m.total_size(&ctx).map_err(MigrationError::Execution)?;
        let actual_migrated = m.actual_migrated(&ctx).map_err(MigrationError::Execution)?;
        let total_migrated = runs::sum_success_migrated(&conn, m.name())?;
        Ok(MigrationStats {
            total_size,
            actual_migrated,
            total_migrated,
            remaining: remaining(total_size, actual_migrated, total_migrated),
            status_counts: runs::count_by_status(&conn, m.name())?,
        })
    }

    fn read_context<'c>(&'c self, conn: &'c Connection, m: &dyn Migrator) -> Result<MigrationContext<'c>> {
        let latest = runs::latest_run(conn, m.name())?;
        let options = latest
            .as_ref()
            .and_then(|r| r.options().cloned())
            .unwrap_or_else(|| m.initial_options());
        let batch = latest.map(|r| r.batch).unwrap_or(0);
        Ok(MigrationContext::new(conn, &self.sources, m, options, batch))
    }
}

fn fetch(conn: &Connection, id: i64) -> Result<MigrationRun> {
    runs::get_run(conn, id)?.ok_or_else(|| MigrationError::NotFound(format!("run {id}")))
}

/// Queue the batch after `current`: reuse the earliest `restart` row when
/// one remains, otherwise open `current.batch + 1`.
fn spawn_next(
    conn: &Connection,
    name: &str,
    current: &MigrationRun,
    options: &Value,
) -> Result<MigrationRun> {
    let meta = run_meta(options, None);
    if let Some(row) = runs::first_restart(conn, name)? {
        runs::set_pending_with_meta(conn, row.id, &meta)?;
        return fetch(conn, row.id);
    }
    Ok(runs::upsert_pending(conn, name, current.batch + 1, &meta)?)
}

#[cfg(test)]
mod tests {
    use super::remaining;

    #[test]
    fn remaining_uses_the_larger_migrated_figure() {
        assert_eq!(remaining(100, 40, 0), 60);
        assert_eq!(remaining(100, 10, 40), 60);
        assert_eq!(remaining(100, 120, 0), 0);
        assert_eq!(remaining(0, 0, 0), 0);
    }
}
