use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::SourceConfig;

/// Fallback connection name when neither the migrator nor the config names one.
pub const DEFAULT_SOURCE_CONNECTION: &str = "legacy";

/// Named legacy data sources (SQLite files opened read-only).
#[derive(Clone, Debug, Default)]
pub struct SourceConnections {
    default_name: Option<String>,
    paths: BTreeMap<String, PathBuf>,
}

impl SourceConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &SourceConfig) -> Self {
        Self {
            default_name: cfg.default_connection.clone(),
            paths: cfg
                .connections
                .iter()
                .map(|(k, v)| (k.clone(), PathBuf::from(v)))
                .collect(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.paths.insert(name.into(), path.into());
        self
    }

    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default_name = Some(name.into());
        self
    }

    pub fn default_name(&self) -> &str {
        self.default_name
            .as_deref()
            .unwrap_or(DEFAULT_SOURCE_CONNECTION)
    }

    /// Open the named connection, or the default one when `name` is `None`.
    pub fn open(&self, name: Option<&str>) -> Result<Connection> {
        let name = name.unwrap_or_else(|| self.default_name());
        let path = self
            .paths
            .get(name)
            .ok_or_else(|| anyhow!("source connection `{name}` is not configured"))?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("opening source `{name}` at {}", path.display()))?;
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_connection_is_an_error() {
        let sources = SourceConnections::new();
        let err = sources.open(None).unwrap_err();
        assert!(err.to_string().contains("`legacy`"));
    }

    #[test]
    fn opens_configured_default_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.sqlite");
        Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE t(id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();
        let sources = SourceConnections::new()
            .with("old", &path)
            .with_default("old");
        let conn = sources.open(None).unwrap();
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
        assert!(conn.execute("INSERT INTO t VALUES (2)", []).is_err());
    }
}
