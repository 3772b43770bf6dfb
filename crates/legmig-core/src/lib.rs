//! Batch state machine and worker plumbing for incremental legacy data
//! migrations. Storage lives in `legmig-kernel`; this crate decides what the
//! ledger rows mean and drives migrators through them.

pub mod actions;
mod config;
mod error;
pub mod machine;
pub mod mapping;
pub mod migrator;
pub mod migrators;
pub mod orchestrator;
pub mod registry;
pub mod runner;
mod source;
pub mod stats;
pub mod worker;

pub use actions::{ActionReport, MigratorAction, Operator, LAST_RUN_KEY};
pub use config::{
    config_schema_json, load_config, load_or_default, parse_config, Config, JobsConfig,
    QueueBackend, SourceConfig, TableCopyConfig, WorkerConfig, CONFIG_ENV,
};
pub use error::MigrationError;
pub use machine::{BatchStateMachine, MigrationStats, RunOutcome};
pub use mapping::MappingScope;
pub use migrator::{HandleParams, MigrationContext, Migrator, Record, ZeroRowPolicy, DEFAULT_GROUP};
pub use registry::{MigratorRegistration, Registry, RESERVED_GROUP};
pub use runner::{Dispatched, JobOutcome, JobRunner, RunnerStop};
pub use source::{SourceConnections, DEFAULT_SOURCE_CONNECTION};
pub use stats::StatsCache;
pub use worker::{run_worker, ExitReason, MemoryProbe, Worker};

pub use legmig_kernel::{Kernel, MigrationRun, RunStatus};

// Re-exported for `inventory::submit!` in downstream crates.
pub use inventory;
