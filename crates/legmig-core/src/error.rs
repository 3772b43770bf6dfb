use legmig_kernel::RunStatus;

/// Errors surfaced by the batch state machine and its collaborators.
#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    /// A pending batch was requested while one is still unresolved.
    #[error(
        "cannot create migration: found existing migration (status: {status}, batch: {batch}) for [{migrator}]"
    )]
    Conflict {
        migrator: String,
        status: RunStatus,
        batch: i64,
    },
    /// Post-`handle` sanity check failed.
    #[error(
        "Migration count mismatch: source data count ({source_count}) does not match stored count ({stored_count})"
    )]
    CountMismatch { source_count: i64, stored_count: i64 },
    /// Any failure raised by a migrator while extracting or loading.
    #[error("{0:#}")]
    Execution(anyhow::Error),
    #[error("restart is not allowed for [{0}]")]
    RestartRefused(String),
    #[error("run {run_id} is {status}, expected ongoing")]
    NotClaimed { run_id: i64, status: RunStatus },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unknown migrator: {0}")]
    UnknownMigrator(String),
    #[error("registry: {0}")]
    Registry(String),
    #[error(transparent)]
    Storage(#[from] rusqlite::Error),
    #[error(transparent)]
    Ledger(#[from] anyhow::Error),
}

impl MigrationError {
    /// Transient failures the job runner may try again. Consistency
    /// violations are terminal and always left to an operator.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::Execution(_) | MigrationError::Storage(_) | MigrationError::Ledger(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_mismatch_message_is_searchable() {
        let err = MigrationError::CountMismatch {
            source_count: 10,
            stored_count: 7,
        };
        let msg = err.to_string();
        assert!(msg.to_lowercase().contains("count mismatch"));
        assert!(msg.contains("(10)") && msg.contains("(7)"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn execution_errors_keep_their_context_chain() {
        let inner = anyhow::anyhow!("disk full").context("writing users");
        let err = MigrationError::Execution(inner);
        assert_eq!(err.to_string(), "writing users: disk full");
        assert!(err.is_retryable());
    }
}
