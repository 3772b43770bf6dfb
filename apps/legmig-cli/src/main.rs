use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use legmig_core::actions::render_stats;
use legmig_core::{
    config_schema_json, load_or_default, ActionReport, MemoryProbe, MigrationError, Operator,
    RESERVED_GROUP,
};
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

mod interactive;

#[derive(Parser)]
#[command(name = "legmig", version, about = "Incremental legacy data migrations")]
struct Cli {
    /// Config file (defaults to $LEGMIG_CONFIG, then ./legmig.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue the next batch for a migrator
    Migrate(NameArgs),
    /// Print progress counters
    Stats(StatsArgs),
    /// Print stats until the migrator is done or failed
    Watch(WatchArgs),
    /// Reset every batch and start over from the first one
    Restart(NameArgs),
    /// Put the latest batch back to pending
    Resume(NameArgs),
    /// Park the active batch
    Pause(NameArgs),
    /// Re-queue every failed batch
    Retry,
    /// Queue the next batch for each migrator in a group (`show` lists groups)
    Group(GroupArgs),
    /// List registered migrators in run order
    List,
    /// Pick a migrator and actions from a prompt
    Interactive,
    /// Print the most recently used migrator
    LastRun,
    /// Config helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Subcommand)]
enum ConfigCmd {
    /// Print the config JSON schema
    Schema(SchemaArgs),
}

#[derive(Args)]
struct NameArgs {
    /// Migrator name
    name: String,
}

#[derive(Args)]
struct StatsArgs {
    name: String,
    /// Bypass the stats cache
    #[arg(long)]
    truth: bool,
    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct WatchArgs {
    name: String,
    /// Polling interval in seconds (defaults to [monitoring] interval_secs)
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[derive(Args)]
struct GroupArgs {
    /// Group name, or `show` to list groups
    group: String,
}

#[derive(Args)]
struct SchemaArgs {
    /// Pretty-print JSON
    #[arg(long)]
    pretty: bool,
}

fn main() {
    legmig_otel::init();
    let cli = Cli::parse();
    let result = run(cli);
    if let Some(mb) = MemoryProbe::new().resident_mb() {
        info!(memory_mb = mb, "memory usage");
    }
    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Commands::Config {
        cmd: ConfigCmd::Schema(args),
    } = &cli.command
    {
        return print_schema(args);
    }
    let (cfg, path) = load_or_default(cli.config.as_deref())?;
    match &path {
        Some(p) => info!(config = %p.display(), "config loaded"),
        None => info!("no config file found; using defaults"),
    }
    let op = Operator::from_config(&cfg)?;
    dispatch(&op, cli.command)
}

fn print_schema(args: &SchemaArgs) -> Result<()> {
    let schema = config_schema_json();
    if args.pretty {
        println!("{}", serde_json::to_string_pretty(&schema)?);
    } else {
        println!("{schema}");
    }
    Ok(())
}

fn dispatch(op: &Operator, command: Commands) -> Result<()> {
    match command {
        Commands::Migrate(args) => println!("{}", ActionReport::Created(op.migrate(&args.name)?)),
        Commands::Stats(args) => {
            let stats = op.stats(&args.name, args.truth)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("{}", render_stats(&args.name, &stats));
            }
        }
        Commands::Watch(args) => {
            let interval = args
                .interval_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| op.interval());
            op.remember(&args.name)?;
            let run = op.watch(&args.name, interval, |stats| {
                println!("{}", render_stats(&args.name, stats));
            })?;
            println!("{}", ActionReport::Finished(run));
        }
        Commands::Restart(args) => {
            let rows = op.restart(&args.name)?;
            println!(
                "{}",
                ActionReport::Restarted {
                    migrator: args.name,
                    rows
                }
            );
        }
        Commands::Resume(args) => println!("{}", ActionReport::Resumed(op.resume(&args.name)?)),
        Commands::Pause(args) => println!("{}", ActionReport::Paused(op.pause(&args.name)?)),
        Commands::Retry => {
            let n = op.retry_failed()?;
            println!("{n} failed batch(es) queued for retry");
        }
        Commands::Group(args) => run_group(op, &args.group)?,
        Commands::List => {
            for m in op.ordered() {
                let desc = m.description().unwrap_or("");
                println!("{:<24} [{}] {desc}", m.name(), m.group());
            }
        }
        Commands::Interactive => {
            let stdin = io::stdin();
            let mut input = stdin.lock();
            interactive::session(op, &mut input, &mut io::stdout())?;
        }
        Commands::LastRun => match op.last_run()? {
            Some(name) => println!("{name}"),
            None => println!("no migrator has run yet"),
        },
        Commands::Config {
            cmd: ConfigCmd::Schema(args),
        } => print_schema(&args)?,
    }
    Ok(())
}

fn run_group(op: &Operator, group: &str) -> Result<()> {
    if group.eq_ignore_ascii_case(RESERVED_GROUP) {
        let groups = op.groups();
        if groups.is_empty() {
            println!("no migrators registered");
        }
        for (name, members) in groups {
            println!("{name}: {}", members.join(", "));
        }
        return Ok(());
    }
    let members = op.group(group)?;
    let mut failed = 0usize;
    for m in members {
        match op.migrate(m.name()) {
            Ok(run) => println!("{}", ActionReport::Created(run)),
            Err(err @ MigrationError::Conflict { .. }) => {
                warn!(migrator = %m.name(), "{err}");
                println!("[{}] skipped: {err}", m.name());
            }
            Err(err) => {
                failed += 1;
                eprintln!("[{}] {err:#}", m.name());
            }
        }
    }
    if failed > 0 {
        bail!("{failed} migrator(s) in group `{group}` could not be queued");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_config_after_subcommand() {
        let cli = Cli::try_parse_from(["legmig", "stats", "users", "--truth", "--config", "x.toml"])
            .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
        match cli.command {
            Commands::Stats(args) => {
                assert_eq!(args.name, "users");
                assert!(args.truth);
                assert!(!args.json);
            }
            _ => panic!("expected stats"),
        }
    }

    #[test]
    fn migrate_requires_a_name() {
        assert!(Cli::try_parse_from(["legmig", "migrate"]).is_err());
        assert!(Cli::try_parse_from(["legmig", "last-run"]).is_ok());
        assert!(Cli::try_parse_from(["legmig", "config", "schema", "--pretty"]).is_ok());
    }
}
