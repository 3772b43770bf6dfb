mod common;

use common::{claim_and_run, open, Scripted};
use legmig_core::{
    parse_config, ActionReport, MigrationError, MigratorAction, Operator, Registry, RunOutcome,
    RunStatus, StatsCache, LAST_RUN_KEY,
};
use rusqlite::Connection;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[test]
fn stats_cache_serves_whole_snapshot_until_bypassed() {
    let (_dir, machine) = open();
    let m = Scripted::new("users", 1..=6, 3);
    let cache = StatsCache::new(Duration::from_secs(60));

    let before = cache.stats(&machine, &m, false).unwrap();
    assert_eq!(before.total_size, 6);
    assert_eq!(before.actual_migrated, 0);
    assert_eq!(before.remaining, 6);

    machine.create_pending(&m).unwrap();
    claim_and_run(&machine, &m).unwrap();

    let cached = cache.stats(&machine, &m, false).unwrap();
    assert_eq!(cached, before, "served from cache");
    assert!(cached.status_counts.is_empty());

    let truth = cache.stats(&machine, &m, true).unwrap();
    assert_eq!(truth.actual_migrated, 3);
    assert_eq!(truth.total_migrated, 3);
    assert_eq!(truth.remaining, 3);
    assert_eq!(truth.status_counts.get("success"), Some(&1));
    assert_eq!(truth.status_counts.get("pending"), Some(&1));
    assert_eq!(cache.stats(&machine, &m, false).unwrap(), truth);
}

#[test]
fn cached_stats_do_not_recount_the_legacy_source() {
    let (_dir, machine) = open();
    let m = Scripted::new("users", 1..=6, 3);
    let cache = StatsCache::new(Duration::from_secs(60));
    for _ in 0..5 {
        assert_eq!(cache.stats(&machine, &m, false).unwrap().total_size, 6);
    }
    assert_eq!(m.size_calls.load(Ordering::SeqCst), 1);

    cache.stats(&machine, &m, true).unwrap();
    assert_eq!(m.size_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn uncached_migrators_always_read_through() {
    let (_dir, machine) = open();
    let mut m = Scripted::new("users", 1..=2, 2);
    m.cached = false;
    let cache = StatsCache::new(Duration::from_secs(60));
    assert_eq!(cache.stats(&machine, &m, false).unwrap().actual_migrated, 0);
    machine.create_pending(&m).unwrap();
    claim_and_run(&machine, &m).unwrap();
    assert_eq!(cache.stats(&machine, &m, false).unwrap().actual_migrated, 2);
}

fn seed_legacy(path: &Path, rows: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE tbl_users (id INTEGER PRIMARY KEY, name TEXT, score REAL, note TEXT)",
    )
    .unwrap();
    let tx = conn.unchecked_transaction().unwrap();
    for i in 1..=rows {
        tx.execute(
            "INSERT INTO tbl_users (id, name, score, note) VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![i * 2, format!("user {i}"), i as f64 / 2.0],
        )
        .unwrap();
    }
    tx.commit().unwrap();
}

fn operator_for(dir: &Path, rows: i64) -> Operator {
    let legacy = dir.join("legacy.sqlite");
    seed_legacy(&legacy, rows);
    let toml = format!(
        r#"
sequence = ["users"]

[ledger]
path = "{ledger}"

[source]
default_connection = "crm"
[source.connections]
crm = "{legacy}"

[[table_copy]]
name = "users"
group = "crm"
source_table = "tbl_users"
target_table = "accounts"
batch_size = 100
"#,
        ledger = dir.join("ledger.sqlite").display(),
        legacy = legacy.display(),
    );
    let cfg = parse_config(&toml).unwrap();
    Operator::from_config(&cfg).unwrap()
}

fn drain(op: &Operator) -> Vec<RunOutcome> {
    let m = op.registry().require("users").unwrap();
    let mut out = Vec::new();
    while let Some(run) = op.machine().kernel().claim_pending_run().unwrap() {
        out.push(op.machine().run(m.as_ref(), run.id).unwrap());
    }
    out
}

#[test]
fn table_copy_moves_every_row_once() {
    let dir = tempfile::tempdir().unwrap();
    let op = operator_for(dir.path(), 250);

    let created = op.migrate("users").unwrap();
    assert_eq!(created.batch, 1);
    assert_eq!(op.last_run().unwrap().as_deref(), Some("users"));

    let outcomes = drain(&op);
    let migrated: Vec<i64> = outcomes
        .iter()
        .filter_map(|o| match o {
            RunOutcome::Success { migrated, .. } => Some(*migrated),
            _ => None,
        })
        .collect();
    assert_eq!(migrated, vec![100, 100, 50]);
    assert!(matches!(outcomes.last(), Some(RunOutcome::Done { batch: 4, .. })));

    let stats = op.stats("users", true).unwrap();
    assert_eq!(stats.total_size, 250);
    assert_eq!(stats.actual_migrated, 250);
    assert_eq!(stats.remaining, 0);

    let ledger = op.machine().kernel().connect().unwrap();
    let (count, name): (i64, String) = ledger
        .query_row(
            "SELECT COUNT(*), (SELECT name FROM accounts WHERE id=1) FROM accounts",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(count, 250);
    assert_eq!(name, "user 1");
    let legacy_col: i64 = ledger
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('accounts') WHERE name='name' OR name='score'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(legacy_col, 2);

    // restart re-copies onto the same target rows instead of duplicating
    assert_eq!(op.restart("users").unwrap(), 4);
    drain(&op);
    let count: i64 = ledger
        .query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 250);
    assert_eq!(op.stats("users", true).unwrap().actual_migrated, 250);
}

#[test]
fn watch_returns_once_done_and_errors_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    let op = operator_for(dir.path(), 5);
    op.migrate("users").unwrap();
    drain(&op);
    let mut ticks = 0;
    let run = op
        .watch("users", Duration::from_millis(10), |s| {
            ticks += 1;
            assert_eq!(s.remaining, 0);
        })
        .unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(ticks, 1);

    let conn = op.machine().kernel().connect().unwrap();
    legmig_kernel::runs::mark_failed(&conn, run.id, "disk on fire").unwrap();
    let err = op
        .watch("users", Duration::from_millis(10), |_| {})
        .unwrap_err();
    assert!(err.to_string().contains("disk on fire"));
}

#[test]
fn apply_dispatches_actions_and_groups_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let op = operator_for(dir.path(), 3);
    assert_eq!(op.groups()["crm"], vec!["users".to_string()]);
    assert_eq!(op.group("crm").unwrap().len(), 1);
    assert!(matches!(op.group("nope"), Err(MigrationError::NotFound(_))));

    match op.apply(MigratorAction::Migrate, "users", |_| {}).unwrap() {
        ActionReport::Created(run) => assert_eq!(run.status, RunStatus::Pending),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        op.apply(MigratorAction::Migrate, "users", |_| {}),
        Err(MigrationError::Conflict { .. })
    ));
    let paused = op.apply(MigratorAction::Pause, "users", |_| {}).unwrap();
    assert_eq!(paused.to_string(), "[users] batch 1 paused");
    assert!(matches!(
        op.apply(MigratorAction::Resume, "users", |_| {}).unwrap(),
        ActionReport::Resumed(_)
    ));
    assert!(matches!(
        op.apply(MigratorAction::Stats, "nobody", |_| {}),
        Err(MigrationError::UnknownMigrator(_))
    ));
    assert_eq!(op.apply(MigratorAction::Exit, "users", |_| {}).unwrap(), ActionReport::Exit);
    assert_eq!(
        op.machine().kernel().get_setting(LAST_RUN_KEY).unwrap().as_deref(),
        Some("users")
    );
}

#[test]
fn continues_stats_action_streams_each_tick() {
    let dir = tempfile::tempdir().unwrap();
    let op = operator_for(dir.path(), 4);
    op.migrate("users").unwrap();
    drain(&op);

    let mut seen = Vec::new();
    let report = op
        .apply(MigratorAction::ContinuesStats, "users", |s| seen.push(s.clone()))
        .unwrap();
    assert!(matches!(report, ActionReport::Finished(ref run) if run.status == RunStatus::Done));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].total_size, 4);
    assert_eq!(seen[0].remaining, 0);
}

#[test]
fn table_copy_entries_reject_reserved_group() {
    let cfg = parse_config(
        r#"
[[table_copy]]
name = "users"
group = "show"
source_table = "tbl_users"
"#,
    )
    .unwrap();
    assert!(matches!(
        Registry::load(&cfg),
        Err(MigrationError::Registry(_))
    ));
}
