use anyhow::{anyhow, Context, Result};
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "LEGMIG_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "legmig.toml";
pub const DEFAULT_LEDGER_PATH: &str = "legmig.sqlite";

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    /// Migrator names that run first, in this order.
    #[serde(default)]
    pub sequence: Vec<String>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    /// Declarative table-to-table migrators.
    #[serde(default)]
    pub table_copy: Vec<TableCopyConfig>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct LedgerConfig {
    /// SQLite file holding runs, mappings, jobs and copied tables.
    #[serde(default)]
    pub path: Option<String>,
}

impl LedgerConfig {
    pub fn path(&self) -> PathBuf {
        PathBuf::from(self.path.as_deref().unwrap_or(DEFAULT_LEDGER_PATH))
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct SourceConfig {
    /// Connection used by migrators that do not name one (defaults to "legacy").
    #[serde(default)]
    pub default_connection: Option<String>,
    /// Named legacy SQLite databases.
    #[serde(default)]
    pub connections: BTreeMap<String, String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct MonitoringConfig {
    /// Refresh interval for continuous stats, in seconds (default 30).
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

impl MonitoringConfig {
    pub fn interval_secs(&self) -> u64 {
        self.interval_secs.unwrap_or(30).max(1)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct StatsConfig {
    /// Time-to-live of cached migrated totals, in seconds (default 30).
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl StatsConfig {
    pub fn ttl_secs(&self) -> u64 {
        self.ttl_secs.unwrap_or(30)
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct WorkerConfig {
    /// Jobs to process before exiting; 0 = unlimited.
    #[serde(default)]
    pub max_jobs: Option<u64>,
    /// Resident memory ceiling in MB (default 512).
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Sleep when no pending batch exists (default 3000).
    #[serde(default)]
    pub idle_sleep_ms: Option<u64>,
    /// Delay between claiming a batch and executing it (default 5000).
    #[serde(default)]
    pub job_delay_ms: Option<u64>,
}

impl WorkerConfig {
    pub fn max_jobs(&self) -> u64 {
        self.max_jobs.unwrap_or(0)
    }
    pub fn memory_mb(&self) -> u64 {
        self.memory_mb.unwrap_or(512)
    }
    pub fn idle_sleep_ms(&self) -> u64 {
        self.idle_sleep_ms.unwrap_or(3_000)
    }
    pub fn job_delay_ms(&self) -> u64 {
        self.job_delay_ms.unwrap_or(5_000)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Durable rows in the ledger database.
    #[default]
    Ledger,
    /// In-process queue; pending jobs are lost on exit.
    Local,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
pub struct JobsConfig {
    /// Attempts per batch job before the run is marked failed (default 5).
    #[serde(default)]
    pub tries: Option<u32>,
    /// Delay before a failed attempt is retried (default 5000).
    #[serde(default)]
    pub backoff_ms: Option<u64>,
    /// Lease length for a dequeued job (default one hour).
    #[serde(default)]
    pub lease_ttl_ms: Option<u64>,
    #[serde(default)]
    pub queue: Option<QueueBackend>,
}

impl JobsConfig {
    pub fn tries(&self) -> u32 {
        self.tries.unwrap_or(5).max(1)
    }
    pub fn backoff_ms(&self) -> u64 {
        self.backoff_ms.unwrap_or(5_000)
    }
    pub fn lease_ttl_ms(&self) -> u64 {
        self.lease_ttl_ms.unwrap_or(3_600_000)
    }
    pub fn queue(&self) -> QueueBackend {
        self.queue.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct TableCopyConfig {
    /// Migrator name; also the default mapping scope.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    /// 1-based position in the run order.
    #[serde(default)]
    pub queue_index: Option<u32>,
    /// Source connection name; falls back to `source.default_connection`.
    #[serde(default)]
    pub connection: Option<String>,
    pub source_table: String,
    /// Table created in the ledger database; defaults to `source_table`.
    #[serde(default)]
    pub target_table: Option<String>,
    /// Integer legacy key column (default "id").
    #[serde(default)]
    pub id_column: Option<String>,
    /// Columns to copy; all source columns when omitted.
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    /// Rows per batch (default 500).
    #[serde(default)]
    pub batch_size: Option<u32>,
    /// Keep polling for new rows after the source is exhausted.
    #[serde(default)]
    pub keep_on_running: Option<bool>,
    #[serde(default)]
    pub cache_stats: Option<bool>,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    Ok(cfg)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    parse_config(&content).with_context(|| format!("invalid config {}", path.display()))
}

/// Resolve the config file: explicit path, then `LEGMIG_CONFIG`, then
/// `./legmig.toml`. Returns defaults when none of them exists. An explicit
/// or env-provided path that does not exist is an error.
pub fn load_or_default(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>)> {
    let chosen = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => std::env::var(CONFIG_ENV)
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from),
    };
    if let Some(path) = chosen {
        let cfg = load_config(&path)?;
        return Ok((cfg, Some(path)));
    }
    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    if fallback.is_file() {
        let cfg = load_config(&fallback)?;
        return Ok((cfg, Some(fallback)));
    }
    Ok((Config::default(), None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const SAMPLE: &str = r#"
sequence = ["users", "orders"]

[ledger]
path = "state/ledger.sqlite"

[source]
default_connection = "crm"
[source.connections]
crm = "legacy/crm.sqlite"

[worker]
max_jobs = 10

[jobs]
tries = 3
queue = "local"

[[table_copy]]
name = "users"
source_table = "tbl_users"
batch_size = 100
"#;

    #[test]
    fn parses_sample_and_fills_defaults() {
        let cfg = parse_config(SAMPLE).unwrap();
        assert_eq!(cfg.sequence, vec!["users", "orders"]);
        assert_eq!(cfg.ledger.path(), PathBuf::from("state/ledger.sqlite"));
        assert_eq!(cfg.source.connections["crm"], "legacy/crm.sqlite");
        assert_eq!(cfg.worker.max_jobs(), 10);
        assert_eq!(cfg.worker.memory_mb(), 512);
        assert_eq!(cfg.worker.idle_sleep_ms(), 3_000);
        assert_eq!(cfg.jobs.tries(), 3);
        assert_eq!(cfg.jobs.backoff_ms(), 5_000);
        assert_eq!(cfg.jobs.queue(), QueueBackend::Local);
        assert_eq!(cfg.monitoring.interval_secs(), 30);
        assert_eq!(cfg.stats.ttl_secs(), 30);
        assert_eq!(cfg.table_copy[0].batch_size, Some(100));
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let err = parse_config("[worker]\nmax_jobs = \"lots\"\n").unwrap_err();
        assert!(err.to_string().contains("lots"), "{err}");
        assert!(parse_config("[jobs]\nqueue = \"redis\"\n").is_err());
    }

    #[test]
    fn schema_json_lists_sections() {
        let schema = config_schema_json();
        let props = schema["properties"].as_object().unwrap();
        for key in ["ledger", "source", "sequence", "worker", "jobs", "table_copy"] {
            assert!(props.contains_key(key), "missing {key}");
        }
    }

    #[test]
    #[serial]
    fn env_path_wins_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[stats]\nttl_secs = 5\n").unwrap();
        std::env::set_var(CONFIG_ENV, &path);
        let (cfg, used) = load_or_default(None).unwrap();
        std::env::remove_var(CONFIG_ENV);
        assert_eq!(cfg.stats.ttl_secs(), 5);
        assert_eq!(used.as_deref(), Some(path.as_path()));
    }

    #[test]
    #[serial]
    fn missing_explicit_path_is_an_error() {
        std::env::remove_var(CONFIG_ENV);
        assert!(load_or_default(Some(Path::new("/nonexistent/legmig.toml"))).is_err());
    }
}
