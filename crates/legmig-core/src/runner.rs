//! Executes queued batch jobs with a fixed retry budget.

use anyhow::anyhow;
use legmig_kernel::RunStatus;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::JobsConfig;
use crate::error::MigrationError;
use crate::machine::{BatchStateMachine, RunOutcome};
use crate::orchestrator::{BatchJob, LeaseToken, Queue, Task};
use crate::registry::Registry;

pub const RUNNER_GROUP: &str = "migrations";
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What one delivered job amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(RunOutcome),
    /// Transient failure; redelivered after the backoff.
    Retrying { run_id: i64, attempt: u32 },
    /// Permanently failed; the run row is `failed`.
    Failed { run_id: i64, message: String },
    /// The run was no longer ours to execute (operator action in between).
    Skipped { run_id: i64 },
    /// Payload was not a batch job; dropped.
    Invalid { task_id: String },
}

/// Runner lifecycle signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStop {
    Running,
    /// Finish what this process dispatched that is still waiting, then stop.
    Drain,
    /// Stop after the job in hand.
    Halt,
}

/// Task ids a claim loop handed to the queue and no runner in this process
/// has finished yet. Shared between the worker and its runner.
#[derive(Debug, Clone, Default)]
pub struct Dispatched {
    ids: Arc<Mutex<HashSet<String>>>,
}

impl Dispatched {
    pub fn record(&self, task_id: String) {
        self.ids.lock().insert(task_id);
    }

    pub fn finish(&self, task_id: &str) {
        self.ids.lock().remove(task_id);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.ids.lock().iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }
}

pub struct JobRunner {
    machine: BatchStateMachine,
    registry: Arc<Registry>,
    queue: Arc<dyn Queue>,
    dispatched: Dispatched,
    tries: u32,
    backoff_ms: u64,
}

impl JobRunner {
    pub fn new(
        machine: BatchStateMachine,
        registry: Arc<Registry>,
        queue: Arc<dyn Queue>,
        jobs: &JobsConfig,
    ) -> Self {
        Self {
            machine,
            registry,
            queue,
            dispatched: Dispatched::default(),
            tries: jobs.tries(),
            backoff_ms: jobs.backoff_ms(),
        }
    }

    /// Share the set of task ids a drain waits on.
    pub fn with_dispatched(mut self, dispatched: Dispatched) -> Self {
        self.dispatched = dispatched;
        self
    }

    /// Lease and execute one ready job. `None` when nothing is ready.
    pub async fn process_one(&self) -> anyhow::Result<Option<JobOutcome>> {
        let Some((task, lease)) = self.queue.try_dequeue(RUNNER_GROUP).await? else {
            return Ok(None);
        };
        let task_id = task.id.clone();
        let outcome = self.process(task, lease).await?;
        if !matches!(outcome, JobOutcome::Retrying { .. }) {
            self.dispatched.finish(&task_id);
        }
        Ok(Some(outcome))
    }

    /// Nothing this process dispatched is left for it to run. Jobs leased by
    /// another live consumer belong to that consumer.
    async fn drained(&self) -> anyhow::Result<bool> {
        if self.dispatched.is_empty() {
            return Ok(true);
        }
        Ok(self.queue.waiting(&self.dispatched.snapshot()).await? == 0)
    }

    /// The row must still be ours: `ongoing` on first delivery; on a retry
    /// `failed`, or `ongoing` when an earlier attempt died mid-batch.
    async fn reclaim(&self, run_id: i64, attempt: u32) -> anyhow::Result<bool> {
        let kernel = self.machine.kernel();
        if attempt > 0 && kernel.reclaim_run_async(run_id, RunStatus::Failed).await? {
            return Ok(true);
        }
        kernel.reclaim_run_async(run_id, RunStatus::Ongoing).await
    }

    async fn process(&self, task: Task, lease: LeaseToken) -> anyhow::Result<JobOutcome> {
        let job = match BatchJob::from_task(&task) {
            Ok(job) => job,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "dropping malformed job");
                self.queue.ack(lease).await?;
                return Ok(JobOutcome::Invalid { task_id: task.id });
            }
        };
        let run_id = job.run_id;
        let attempt = task.attempt + 1;

        if !self.reclaim(run_id, task.attempt).await? {
            info!(migrator = %job.migrate, run_id, "run changed state before execution; skipping");
            self.queue.ack(lease).await?;
            return Ok(JobOutcome::Skipped { run_id });
        }

        let Some(migrator) = self.registry.get(&job.migrate) else {
            let message = MigrationError::UnknownMigrator(job.migrate.clone()).to_string();
            self.machine
                .kernel()
                .mark_run_failed_async(run_id, &message)
                .await?;
            self.queue.ack(lease).await?;
            error!(migrator = %job.migrate, run_id, "no migrator registered under this name");
            return Ok(JobOutcome::Failed { run_id, message });
        };

        let machine = self.machine.clone();
        let result = tokio::task::spawn_blocking(move || machine.run(migrator.as_ref(), run_id))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?;

        match result {
            Ok(outcome) => {
                self.queue.ack(lease).await?;
                Ok(JobOutcome::Completed(outcome))
            }
            Err(MigrationError::NotClaimed { .. } | MigrationError::NotFound(_)) => {
                self.queue.ack(lease).await?;
                Ok(JobOutcome::Skipped { run_id })
            }
            Err(err) if err.is_retryable() && attempt < self.tries => {
                warn!(
                    migrator = %job.migrate,
                    run_id,
                    attempt,
                    tries = self.tries,
                    error = %err,
                    "batch attempt failed; will retry"
                );
                self.queue.nack(lease, Some(self.backoff_ms)).await?;
                Ok(JobOutcome::Retrying { run_id, attempt })
            }
            Err(err) => {
                let message = if err.is_retryable() {
                    let message = format!("[migration job failed after {attempt} attempts]: {err}");
                    self.machine
                        .kernel()
                        .mark_run_failed_async(run_id, &message)
                        .await?;
                    message
                } else {
                    err.to_string()
                };
                error!(migrator = %job.migrate, run_id, attempt, "batch job failed permanently");
                self.queue.ack(lease).await?;
                Ok(JobOutcome::Failed { run_id, message })
            }
        }
    }

    /// Process jobs until told to stop. Returns the number of jobs handled.
    pub async fn run(self, mut stop: watch::Receiver<RunnerStop>) -> anyhow::Result<u64> {
        let mut handled = 0u64;
        loop {
            let state = *stop.borrow();
            match state {
                RunnerStop::Halt => break,
                RunnerStop::Drain => {
                    if self.drained().await? {
                        break;
                    }
                }
                RunnerStop::Running => {}
            }
            match self.process_one().await {
                Ok(Some(_)) => {
                    handled += 1;
                    continue;
                }
                Ok(None) => {}
                Err(err) => warn!(error = %err, "job runner iteration failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(handled, "job runner stopped");
        Ok(handled)
    }
}
