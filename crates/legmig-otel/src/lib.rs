use once_cell::sync::OnceCell;
use std::path::PathBuf;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

pub const LOG_DIR_ENV: &str = "LEGMIG_LOG_DIR";
pub const LOG_ROTATION_ENV: &str = "LEGMIG_LOG_ROTATION";
const LOG_PREFIX: &str = "legmig.log";

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// How often the file log rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Daily,
    Hourly,
    Minutely,
}

impl Rotation {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

/// Rolling file settings read from the environment; `None` when
/// `LEGMIG_LOG_DIR` is unset or blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLog {
    pub dir: PathBuf,
    pub rotation: Rotation,
}

impl FileLog {
    pub fn from_env() -> Option<Self> {
        let dir = std::env::var(LOG_DIR_ENV).ok()?;
        if dir.trim().is_empty() {
            return None;
        }
        let rotation = std::env::var(LOG_ROTATION_ENV)
            .map(|v| Rotation::parse(&v))
            .unwrap_or(Rotation::Daily);
        Some(Self {
            dir: PathBuf::from(dir),
            rotation,
        })
    }
}

/// Install the global subscriber. Console output goes to stderr so command
/// output on stdout stays machine-readable. Safe to call more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install(filter, FileLog::from_env());
}

fn install(filter: EnvFilter, file: Option<FileLog>) {
    let console = fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(console.with_filter(filter));
    let Some(file) = file else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&file.dir).is_err() {
        tracing::warn!(directory = %file.dir.display(), "failed to create log directory");
    }
    let writer = match file.rotation {
        Rotation::Hourly => tracing_appender::rolling::hourly(&file.dir, LOG_PREFIX),
        Rotation::Minutely => tracing_appender::rolling::minutely(&file.dir, LOG_PREFIX),
        Rotation::Daily => tracing_appender::rolling::daily(&file.dir, LOG_PREFIX),
    };
    let (nb, guard) = tracing_appender::non_blocking(writer);
    let _ = FILE_GUARD.set(guard);
    let file_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(nb)
        .with_filter(file_filter);
    let _ = registry.with(file_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn rotation_defaults_to_daily() {
        assert_eq!(Rotation::parse("HOURLY"), Rotation::Hourly);
        assert_eq!(Rotation::parse("minutely"), Rotation::Minutely);
        assert_eq!(Rotation::parse("weekly"), Rotation::Daily);
    }

    #[test]
    #[serial]
    fn file_log_reads_environment() {
        std::env::remove_var(LOG_DIR_ENV);
        assert_eq!(FileLog::from_env(), None);

        let dir = tempfile::tempdir().unwrap();
        std::env::set_var(LOG_DIR_ENV, dir.path());
        std::env::set_var(LOG_ROTATION_ENV, "hourly");
        let file = FileLog::from_env().expect("configured");
        assert_eq!(file.dir, dir.path());
        assert_eq!(file.rotation, Rotation::Hourly);

        std::env::set_var(LOG_DIR_ENV, "  ");
        assert_eq!(FileLog::from_env(), None);
        std::env::remove_var(LOG_DIR_ENV);
        std::env::remove_var(LOG_ROTATION_ENV);
    }

    #[test]
    #[serial]
    fn init_writes_to_the_rolling_file() {
        let dir = tempfile::tempdir().unwrap();
        install(
            EnvFilter::new("info"),
            Some(FileLog {
                dir: dir.path().to_path_buf(),
                rotation: Rotation::Daily,
            }),
        );
        tracing::info!("file layer online");
        // second install is a no-op
        init();
        assert!(dir.path().exists());
    }
}
