use legmig_core::{load_config, Operator, RunStatus};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::tempdir;

fn write_config(dir: &Path) -> PathBuf {
    let legacy = dir.join("legacy.sqlite");
    let conn = rusqlite::Connection::open(&legacy).expect("open legacy");
    conn.execute_batch(
        "CREATE TABLE tbl_users (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO tbl_users (id, name) VALUES (1, 'a'), (2, 'b'), (3, 'c');",
    )
    .expect("seed legacy");
    let path = dir.join("legmig.toml");
    let body = format!(
        r#"
[ledger]
path = "{}"

[source]
default_connection = "crm"
[source.connections]
crm = "{}"

[worker]
idle_sleep_ms = 50
job_delay_ms = 0

[jobs]
backoff_ms = 0

[[table_copy]]
name = "users"
source_table = "tbl_users"
batch_size = 2
"#,
        dir.join("ledger.sqlite").display(),
        legacy.display()
    );
    fs::write(&path, body).expect("write config");
    path
}

#[test]
fn worker_runs_one_batch_and_exits() {
    let tmp = tempdir().expect("tmpdir");
    let cfg_path = write_config(tmp.path());
    let cfg = load_config(&cfg_path).expect("config");
    let op = Operator::from_config(&cfg).expect("operator");
    op.migrate("users").expect("queue first batch");

    assert_cmd::Command::cargo_bin("legmig-worker")
        .expect("binary")
        .env_remove("LEGMIG_CONFIG")
        .arg("--config")
        .arg(&cfg_path)
        .args(["--max-jobs", "1"])
        .timeout(Duration::from_secs(60))
        .assert()
        .success();

    let runs = op.machine().kernel().list_runs("users").expect("runs");
    let summary: Vec<(i64, RunStatus)> = runs.iter().map(|r| (r.batch, r.status)).collect();
    assert_eq!(
        summary,
        vec![(1, RunStatus::Success), (2, RunStatus::Pending)]
    );
    assert_eq!(runs[0].total_migrated, Some(2));
}

#[test]
fn missing_config_file_is_an_error() {
    let tmp = tempdir().expect("tmpdir");
    assert_cmd::Command::cargo_bin("legmig-worker")
        .expect("binary")
        .arg("--config")
        .arg(tmp.path().join("absent.toml"))
        .args(["--max-jobs", "1"])
        .timeout(Duration::from_secs(30))
        .assert()
        .failure();
}
