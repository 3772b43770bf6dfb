//! Capability interface a legacy entity migrator implements, and the
//! context handed to each of its hooks.

use anyhow::Result;
use legmig_kernel::MappingRow;
use once_cell::unsync::OnceCell;
use rusqlite::Connection;
use serde_json::{json, Value};

use crate::mapping::{self, MappingScope};
use crate::source::SourceConnections;

/// One legacy record as a JSON object.
pub type Record = serde_json::Map<String, Value>;

pub const DEFAULT_GROUP: &str = "default";

/// What happens when a batch finds no source records.
///
/// `keep_on_until_total_size` wins over `keep_on_running`; with both unset
/// the migrator is marked done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZeroRowPolicy {
    /// Stay pending and poll again (append-only sources).
    pub keep_on_running: bool,
    /// Keep spawning batches while `total_size` exceeds the migrated count.
    pub keep_on_until_total_size: bool,
}

/// Input to [`Migrator::handle`].
#[derive(Debug, Clone)]
pub struct HandleParams {
    pub source_data: Vec<Record>,
    pub size: i64,
    pub options: Value,
}

pub trait Migrator: Send + Sync {
    /// Stable identity; keys every ledger row of this migrator.
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn group(&self) -> &str {
        DEFAULT_GROUP
    }

    /// 1-based preferred position in the run order.
    fn queue_index(&self) -> Option<u32> {
        None
    }

    /// Named source connection; `None` uses the configured default.
    fn connection(&self) -> Option<&str> {
        None
    }

    fn mapping_scope(&self) -> MappingScope {
        MappingScope::new(self.name(), self.name())
    }

    fn zero_row_policy(&self) -> ZeroRowPolicy {
        ZeroRowPolicy::default()
    }

    /// Whether stats may serve the migrated count from the TTL cache.
    fn cache_stats(&self) -> bool {
        true
    }

    fn allow_restart(&self) -> bool {
        true
    }

    /// Options for the first batch and for every restart.
    fn initial_options(&self) -> Value {
        json!({})
    }

    /// Options for the batch after a successful one.
    fn next_options(&self, current: &Value, _params: &HandleParams) -> Value {
        current.clone()
    }

    fn source_data(&self, ctx: &MigrationContext<'_>) -> Result<Vec<Record>>;

    /// Load the batch. Runs inside the batch transaction, so every write made
    /// through `ctx.ledger()` commits or rolls back with the run status.
    fn handle(&self, ctx: &MigrationContext<'_>, params: &HandleParams) -> Result<()>;

    /// Records available in the legacy source.
    fn total_size(&self, _ctx: &MigrationContext<'_>) -> Result<i64> {
        Ok(0)
    }

    /// Records present in the new system.
    fn actual_migrated(&self, ctx: &MigrationContext<'_>) -> Result<i64> {
        ctx.count_mapped()
    }

    /// Independent count of what `handle` stored, compared against
    /// `params.size`. `None` skips the check.
    fn stored_count(&self, _ctx: &MigrationContext<'_>, _params: &HandleParams) -> Result<Option<i64>> {
        Ok(None)
    }
}

/// Everything a migrator hook may touch: the ledger connection (the open
/// batch transaction during `run`), its legacy source and its options.
pub struct MigrationContext<'a> {
    ledger: &'a Connection,
    sources: &'a SourceConnections,
    connection: Option<String>,
    scope: MappingScope,
    legacy: OnceCell<Connection>,
    options: Value,
    batch: i64,
}

impl<'a> MigrationContext<'a> {
    pub fn new(
        ledger: &'a Connection,
        sources: &'a SourceConnections,
        migrator: &dyn Migrator,
        options: Value,
        batch: i64,
    ) -> Self {
        Self {
            ledger,
            sources,
            connection: migrator.connection().map(str::to_string),
            scope: migrator.mapping_scope(),
            legacy: OnceCell::new(),
            options,
            batch,
        }
    }

    pub fn ledger(&self) -> &Connection {
        self.ledger
    }

    /// Legacy source connection, opened on first use.
    pub fn source(&self) -> Result<&Connection> {
        self.legacy
            .get_or_try_init(|| self.sources.open(self.connection.as_deref()))
    }

    pub fn options(&self) -> &Value {
        &self.options
    }

    pub fn batch(&self) -> i64 {
        self.batch
    }

    pub fn scope(&self) -> &MappingScope {
        &self.scope
    }

    pub fn record_mappings(
        &self,
        records: Vec<Record>,
        legacy_id_field: &str,
        new_id_field: &str,
    ) -> Result<Vec<Record>> {
        mapping::record_mappings(self.ledger, &self.scope, records, legacy_id_field, new_id_field)
    }

    pub fn count_mapped(&self) -> Result<i64> {
        mapping::count_mapped(self.ledger, &self.scope)
    }

    pub fn lookup_mappings(&self, legacy_ids: &[i64]) -> Result<Vec<MappingRow>> {
        mapping::lookup_mappings(self.ledger, &self.scope, legacy_ids)
    }
}
