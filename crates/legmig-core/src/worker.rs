//! Long-running claim loop: pending row -> ongoing -> queued batch job.

use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{Config, QueueBackend, WorkerConfig};
use crate::machine::BatchStateMachine;
use crate::orchestrator::{BatchJob, LedgerQueue, LocalQueue, Queue};
use crate::registry::Registry;
use crate::runner::{Dispatched, JobRunner, RunnerStop};

/// Why the claim loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Shutdown,
    MaxJobs,
    MemoryLimit,
}

/// Resident memory of the current process.
pub struct MemoryProbe {
    sys: System,
    pid: Option<Pid>,
}

impl MemoryProbe {
    pub fn new() -> Self {
        Self {
            sys: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Resident set size in bytes, if the platform reports it.
    pub fn resident_bytes(&mut self) -> Option<u64> {
        let pid = self.pid?;
        self.sys
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.sys.process(pid).map(|p| p.memory())
    }

    pub fn resident_mb(&mut self) -> Option<u64> {
        self.resident_bytes().map(|b| b / (1024 * 1024))
    }
}

impl Default for MemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Worker {
    machine: BatchStateMachine,
    queue: Arc<dyn Queue>,
    dispatched: Dispatched,
    settings: WorkerConfig,
    memory: MemoryProbe,
}

/// Sleep for `ms`, waking early on shutdown. Returns true when shutting down.
async fn pause(ms: u64, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let changed = tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(ms)) => None,
        changed = shutdown.changed() => Some(changed.is_ok()),
    };
    match changed {
        None => false,
        Some(false) => true,
        Some(true) => *shutdown.borrow(),
    }
}

impl Worker {
    pub fn new(machine: BatchStateMachine, queue: Arc<dyn Queue>, settings: WorkerConfig) -> Self {
        Self {
            machine,
            queue,
            dispatched: Dispatched::default(),
            settings,
            memory: MemoryProbe::new(),
        }
    }

    /// Record every dispatched task id in `dispatched`.
    pub fn with_dispatched(mut self, dispatched: Dispatched) -> Self {
        self.dispatched = dispatched;
        self
    }

    /// Claim pending batches and hand them to the queue until a limit is hit
    /// or shutdown is signalled. A dispatch fault marks that run failed and
    /// the loop carries on.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> ExitReason {
        let max_jobs = self.settings.max_jobs();
        let memory_mb = self.settings.memory_mb();
        let idle_ms = self.settings.idle_sleep_ms();
        let delay_ms = self.settings.job_delay_ms();
        let mut dispatched = 0u64;
        info!(max_jobs, memory_mb, "worker started");
        loop {
            if *shutdown.borrow() {
                return ExitReason::Shutdown;
            }
            let claimed = match self.machine.kernel().claim_pending_run_async().await {
                Ok(claimed) => claimed,
                Err(err) => {
                    error!(error = %err, "claiming a pending batch failed");
                    None
                }
            };
            let Some(run) = claimed else {
                if pause(idle_ms, &mut shutdown).await {
                    return ExitReason::Shutdown;
                }
                continue;
            };

            let job = BatchJob {
                run_id: run.id,
                migrate: run.migrate.clone(),
            };
            match self.queue.enqueue_after(job.into_task(), delay_ms).await {
                Ok(task_id) => {
                    info!(
                        migrator = %run.migrate,
                        batch = run.batch,
                        run_id = run.id,
                        task_id = %task_id,
                        "batch dispatched"
                    );
                    self.dispatched.record(task_id);
                }
                Err(err) => {
                    error!(migrator = %run.migrate, run_id = run.id, error = %err, "dispatch failed");
                    let message = format!("dispatch failed: {err:#}");
                    if let Err(mark_err) = self
                        .machine
                        .kernel()
                        .mark_run_failed_async(run.id, &message)
                        .await
                    {
                        error!(run_id = run.id, error = %mark_err, "could not mark run failed");
                    }
                }
            }

            dispatched += 1;
            if max_jobs > 0 && dispatched >= max_jobs {
                info!(dispatched, "max jobs reached");
                return ExitReason::MaxJobs;
            }
            if let Some(used) = self.memory.resident_mb() {
                if used >= memory_mb {
                    warn!(used_mb = used, limit_mb = memory_mb, "memory limit reached");
                    return ExitReason::MemoryLimit;
                }
            }
            if pause(delay_ms, &mut shutdown).await {
                return ExitReason::Shutdown;
            }
        }
    }
}

pub fn build_queue(cfg: &Config, machine: &BatchStateMachine) -> Arc<dyn Queue> {
    match cfg.jobs.queue() {
        QueueBackend::Ledger => Arc::new(LedgerQueue::new(
            machine.kernel().clone(),
            cfg.jobs.lease_ttl_ms(),
        )),
        QueueBackend::Local => Arc::new(LocalQueue::with_lease_ttl(cfg.jobs.lease_ttl_ms())),
    }
}

/// Run the claim loop and a job runner side by side. On shutdown the runner
/// stops after the job in hand; on a limit exit it first drains what this
/// loop queued and no other consumer holds.
pub async fn run_worker(
    cfg: &Config,
    machine: BatchStateMachine,
    registry: Arc<Registry>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<ExitReason> {
    let queue = build_queue(cfg, &machine);
    let dispatched = Dispatched::default();
    let runner = JobRunner::new(machine.clone(), registry, queue.clone(), &cfg.jobs)
        .with_dispatched(dispatched.clone());
    let (stop_tx, stop_rx) = watch::channel(RunnerStop::Running);
    let runner_task = tokio::spawn(runner.run(stop_rx));

    let mut worker = Worker::new(machine, queue, cfg.worker.clone()).with_dispatched(dispatched);
    let reason = worker.run(shutdown).await;
    let stop = match reason {
        ExitReason::Shutdown => RunnerStop::Halt,
        ExitReason::MaxJobs | ExitReason::MemoryLimit => RunnerStop::Drain,
    };
    let _ = stop_tx.send(stop);
    match runner_task.await {
        Ok(Ok(handled)) => info!(handled, ?reason, "worker exited"),
        Ok(Err(err)) => warn!(error = %err, "job runner ended with an error"),
        Err(err) => warn!(error = %err, "job runner task panicked"),
    }
    Ok(reason)
}
