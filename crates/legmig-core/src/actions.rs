//! Operator actions: the façade the CLI drives.

use anyhow::{anyhow, Context};
use legmig_kernel::{Kernel, MigrationRun, RunStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::Config;
use crate::error::MigrationError;
use crate::machine::{BatchStateMachine, MigrationStats, Result};
use crate::migrator::Migrator;
use crate::registry::Registry;
use crate::source::SourceConnections;
use crate::stats::StatsCache;

/// Settings key holding the most recently acted-on migrator.
pub const LAST_RUN_KEY: &str = "last_run_migrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigratorAction {
    Migrate,
    Stats,
    Restart,
    Resume,
    Pause,
    ContinuesStats,
    Exit,
}

impl MigratorAction {
    pub const ALL: [MigratorAction; 7] = [
        MigratorAction::Migrate,
        MigratorAction::Stats,
        MigratorAction::Restart,
        MigratorAction::Resume,
        MigratorAction::Pause,
        MigratorAction::ContinuesStats,
        MigratorAction::Exit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigratorAction::Migrate => "migrate",
            MigratorAction::Stats => "stats",
            MigratorAction::Restart => "restart",
            MigratorAction::Resume => "resume",
            MigratorAction::Pause => "pause",
            MigratorAction::ContinuesStats => "continues_stats",
            MigratorAction::Exit => "exit",
        }
    }
}

impl fmt::Display for MigratorAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigratorAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let norm = s.trim().to_ascii_lowercase().replace('-', "_");
        MigratorAction::ALL
            .into_iter()
            .find(|a| a.as_str() == norm)
            .ok_or_else(|| format!("unknown action `{s}`"))
    }
}

/// Result of one operator action, printable for humans.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionReport {
    Created(MigrationRun),
    Stats { migrator: String, stats: MigrationStats },
    Restarted { migrator: String, rows: usize },
    Resumed(MigrationRun),
    Paused(MigrationRun),
    Finished(MigrationRun),
    Exit,
}

impl fmt::Display for ActionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionReport::Created(run) => write!(
                f,
                "[{}] batch {} queued (run {})",
                run.migrate, run.batch, run.id
            ),
            ActionReport::Stats { migrator, stats } => {
                write!(f, "{}", render_stats(migrator, stats))
            }
            ActionReport::Restarted { migrator, rows } => {
                write!(f, "[{migrator}] restarted ({rows} rows reset)")
            }
            ActionReport::Resumed(run) => {
                write!(f, "[{}] batch {} resumed", run.migrate, run.batch)
            }
            ActionReport::Paused(run) => write!(f, "[{}] batch {} paused", run.migrate, run.batch),
            ActionReport::Finished(run) => write!(
                f,
                "[{}] finished at batch {} ({})",
                run.migrate, run.batch, run.status
            ),
            ActionReport::Exit => f.write_str("bye"),
        }
    }
}

pub fn render_stats(migrator: &str, stats: &MigrationStats) -> String {
    let mut out = format!(
        "[{migrator}]\n  total size:      {}\n  actual migrated: {}\n  total migrated:  {}\n  remaining:       {}",
        stats.total_size, stats.actual_migrated, stats.total_migrated, stats.remaining
    );
    for status in RunStatus::ALL {
        let n = stats.status_counts.get(status.as_str()).copied().unwrap_or(0);
        if n > 0 {
            out.push_str(&format!("\n  {:<16} {n}", format!("{status}:")));
        }
    }
    out
}

/// Everything the operator can do, bound to one ledger and registry.
pub struct Operator {
    machine: BatchStateMachine,
    registry: Arc<Registry>,
    stats: StatsCache,
    sequence: Vec<String>,
    interval: Duration,
}

impl Operator {
    pub fn new(machine: BatchStateMachine, registry: Arc<Registry>, cfg: &Config) -> Self {
        Self {
            machine,
            registry,
            stats: StatsCache::new(Duration::from_secs(cfg.stats.ttl_secs())),
            sequence: cfg.sequence.clone(),
            interval: Duration::from_secs(cfg.monitoring.interval_secs()),
        }
    }

    /// Open the configured ledger and load every registered migrator.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let path = cfg.ledger.path();
        let kernel = Kernel::open(&path)
            .with_context(|| format!("opening ledger {}", path.display()))?;
        let machine = BatchStateMachine::new(kernel, SourceConnections::from_config(&cfg.source));
        let registry = Registry::load(cfg)?;
        Ok(Self::new(machine, Arc::new(registry), cfg))
    }

    pub fn machine(&self) -> &BatchStateMachine {
        &self.machine
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn ordered(&self) -> Vec<Arc<dyn Migrator>> {
        self.registry.ordered(&self.sequence)
    }

    pub fn groups(&self) -> BTreeMap<String, Vec<String>> {
        self.registry.groups(&self.sequence)
    }

    pub fn group(&self, group: &str) -> Result<Vec<Arc<dyn Migrator>>> {
        let members = self.registry.in_group(group, &self.sequence);
        if members.is_empty() {
            return Err(MigrationError::NotFound(format!("group `{group}`")));
        }
        Ok(members)
    }

    fn resolve(&self, name: &str) -> Result<Arc<dyn Migrator>> {
        let m = self.registry.require(name)?;
        self.remember(name)?;
        Ok(m)
    }

    pub fn migrate(&self, name: &str) -> Result<MigrationRun> {
        let m = self.resolve(name)?;
        self.machine.create_pending(m.as_ref())
    }

    pub fn stats(&self, name: &str, truth: bool) -> Result<MigrationStats> {
        let m = self.registry.require(name)?;
        self.stats.stats(&self.machine, m.as_ref(), truth)
    }

    pub fn restart(&self, name: &str) -> Result<usize> {
        let m = self.resolve(name)?;
        self.machine.restart(m.as_ref())
    }

    pub fn resume(&self, name: &str) -> Result<MigrationRun> {
        self.resolve(name)?;
        self.machine.resume(name)
    }

    pub fn pause(&self, name: &str) -> Result<MigrationRun> {
        self.resolve(name)?;
        self.machine.pause(name)
    }

    pub fn retry_failed(&self) -> Result<usize> {
        self.machine.retry_failed()
    }

    pub fn should_terminate(&self, name: &str) -> Result<Option<MigrationRun>> {
        self.machine.should_terminate(name)
    }

    pub fn last_run(&self) -> Result<Option<String>> {
        Ok(self.machine.kernel().get_setting(LAST_RUN_KEY)?)
    }

    pub fn remember(&self, name: &str) -> Result<()> {
        Ok(self.machine.kernel().put_setting(LAST_RUN_KEY, name)?)
    }

    /// Poll stats every `interval` until the migrator finishes. Returns the
    /// terminal row on `done` after one last uncached stats tick; a `failed`
    /// row is an error carrying the stored message.
    pub fn watch(
        &self,
        name: &str,
        interval: Duration,
        mut on_tick: impl FnMut(&MigrationStats),
    ) -> Result<MigrationRun> {
        self.registry.require(name)?;
        loop {
            if let Some(run) = self.should_terminate(name)? {
                if run.status == RunStatus::Done {
                    on_tick(&self.stats(name, true)?);
                    info!(migrator = %name, batch = run.batch, "watch finished");
                    return Ok(run);
                }
                let message = run.message.clone().unwrap_or_default();
                return Err(MigrationError::Execution(anyhow!(
                    "[{name}] batch {} failed: {message}",
                    run.batch
                )));
            }
            on_tick(&self.stats(name, false)?);
            std::thread::sleep(interval);
        }
    }

    /// Run one action against `name`. `on_tick` receives every stats
    /// snapshot `continues_stats` produces while it waits.
    pub fn apply(
        &self,
        action: MigratorAction,
        name: &str,
        on_tick: impl FnMut(&MigrationStats),
    ) -> Result<ActionReport> {
        Ok(match action {
            MigratorAction::Migrate => ActionReport::Created(self.migrate(name)?),
            MigratorAction::Stats => ActionReport::Stats {
                migrator: name.to_string(),
                stats: self.stats(name, false)?,
            },
            MigratorAction::Restart => ActionReport::Restarted {
                migrator: name.to_string(),
                rows: self.restart(name)?,
            },
            MigratorAction::Resume => ActionReport::Resumed(self.resume(name)?),
            MigratorAction::Pause => ActionReport::Paused(self.pause(name)?),
            MigratorAction::ContinuesStats => {
                ActionReport::Finished(self.watch(name, self.interval, on_tick)?)
            }
            MigratorAction::Exit => ActionReport::Exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_parse_loosely() {
        assert_eq!(
            "continues-stats".parse::<MigratorAction>().unwrap(),
            MigratorAction::ContinuesStats
        );
        assert_eq!(" Migrate ".parse::<MigratorAction>().unwrap(), MigratorAction::Migrate);
        assert!("launch".parse::<MigratorAction>().is_err());
    }

    #[test]
    fn stats_render_lists_nonzero_statuses() {
        let mut stats = MigrationStats {
            total_size: 100,
            actual_migrated: 40,
            total_migrated: 40,
            remaining: 60,
            ..Default::default()
        };
        stats.status_counts.insert("success".into(), 2);
        let text = render_stats("users", &stats);
        assert!(text.contains("remaining:       60"));
        assert!(text.contains("success:"));
        assert!(!text.contains("failed:"));
    }
}
