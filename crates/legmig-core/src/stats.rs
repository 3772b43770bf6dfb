use anyhow::anyhow;
use moka::sync::Cache;
use std::time::Duration;

use crate::error::MigrationError;
use crate::machine::{BatchStateMachine, MigrationStats, Result};
use crate::migrator::Migrator;

const CACHE_CAPACITY: u64 = 1024;

fn cache_key(name: &str) -> String {
    format!("legacy_stats:{name}")
}

/// Read-through cache of each migrator's full progress snapshot, bounded by
/// TTL. Entries are never invalidated explicitly.
#[derive(Clone)]
pub struct StatsCache {
    snapshots: Cache<String, MigrationStats>,
}

impl StatsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            snapshots: Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(ttl.max(Duration::from_secs(1)))
                .build(),
        }
    }

    /// Progress for `m`. `truth` bypasses the cache, as does a migrator
    /// that opts out of cached stats.
    pub fn stats(
        &self,
        machine: &BatchStateMachine,
        m: &dyn Migrator,
        truth: bool,
    ) -> Result<MigrationStats> {
        if truth || !m.cache_stats() {
            let fresh = machine.stats(m)?;
            self.snapshots.insert(cache_key(m.name()), fresh.clone());
            return Ok(fresh);
        }
        self.snapshots
            .try_get_with(cache_key(m.name()), || machine.stats(m))
            .map_err(|e| MigrationError::Ledger(anyhow!("{e}")))
    }
}

impl std::fmt::Debug for StatsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsCache")
            .field("entries", &self.snapshots.entry_count())
            .finish()
    }
}
