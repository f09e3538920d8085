//! Thin maintenance CLI over the storage engine's library entry points.
//!
//! Exit codes: 0 success, 1 usage error, 2 database error. Termination by
//! SIGINT/SIGTERM surfaces as 130/143 through the default signal
//! disposition.

use clap::{Parser, Subcommand};
use plexusdb_storage::check::{CheckOptions, RepairOptions, check_database, repair_database};
use plexusdb_storage::compact::{
    AutoCompactOptions, CompactMode, CompactOptions, GcOptions, auto_compact_database,
    compact_database, gc_database,
};
use plexusdb_storage::engine::Engine;
use plexusdb_storage::segment::Order;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "plexusdb", version, arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify segment page checksums against the manifest.
    Check(CheckArgs),
    /// Rebuild corrupted orderings from the surviving fact set.
    Repair(RepairArgs),
    /// Compact L0 runs and segments.
    Compact(CompactArgs),
    /// Heuristic-driven incremental compaction.
    AutoCompact(AutoCompactArgs),
    /// Reclaim orphan pages left behind by incremental compaction.
    Gc(GcArgs),
    /// Print node and edge counts by label and relation type.
    Stats(StatsArgs),
}

#[derive(Parser)]
struct CheckArgs {
    /// Database base path (files live at `<path>.ndb`, `<path>.wal`, ...).
    #[arg(long)]
    db: PathBuf,

    /// Also cross-check that the six orderings agree on the fact set.
    #[arg(long)]
    strict: bool,
}

#[derive(Parser)]
struct RepairArgs {
    #[arg(long)]
    db: PathBuf,

    /// Rebuild only the damaged primaries instead of whole orderings.
    #[arg(long)]
    fast: bool,
}

#[derive(Parser)]
struct CompactArgs {
    #[arg(long)]
    db: PathBuf,

    /// rewrite (default) or incremental.
    #[arg(long, value_enum, default_value = "rewrite")]
    mode: CliCompactMode,

    /// Restrict to some orderings, e.g. `--orders SPO,OSP`.
    #[arg(long, value_delimiter = ',')]
    orders: Vec<CliOrder>,

    /// Proceed even while readers pin older epochs.
    #[arg(long)]
    ignore_readers: bool,
}

#[derive(Parser)]
struct AutoCompactArgs {
    #[arg(long)]
    db: PathBuf,

    #[arg(long)]
    ignore_readers: bool,
}

#[derive(Parser)]
struct GcArgs {
    #[arg(long)]
    db: PathBuf,

    /// Skip reclamation while readers pin older epochs (default on).
    #[arg(long, default_value_t = true)]
    respect_readers: bool,
}

#[derive(Parser)]
struct StatsArgs {
    #[arg(long)]
    db: PathBuf,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliCompactMode {
    Rewrite,
    Incremental,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
#[value(rename_all = "UPPER")]
enum CliOrder {
    Spo,
    Sop,
    Pos,
    Pso,
    Osp,
    Ops,
}

impl From<CliOrder> for Order {
    fn from(value: CliOrder) -> Self {
        match value {
            CliOrder::Spo => Order::Spo,
            CliOrder::Sop => Order::Sop,
            CliOrder::Pos => Order::Pos,
            CliOrder::Pso => Order::Pso,
            CliOrder::Osp => Order::Osp,
            CliOrder::Ops => Order::Ops,
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version are successful outputs, anything else is a
            // usage error.
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = e
                .downcast_ref::<plexusdb_storage::Error>()
                .map(|err| err.exit_code() as u8)
                .unwrap_or(2);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Check(args) => {
            let report = check_database(&args.db, CheckOptions { strict: args.strict })?;
            print_json(&report)?;
            if !report.ok {
                return Err(plexusdb_storage::Error::StorageCorrupted(
                    "check found corrupted pages",
                )
                .into());
            }
        }
        Commands::Repair(args) => {
            let report = repair_database(&args.db, RepairOptions { fast: args.fast })?;
            print_json(&report)?;
        }
        Commands::Compact(args) => {
            let opts = CompactOptions {
                mode: match args.mode {
                    CliCompactMode::Rewrite => CompactMode::Rewrite,
                    CliCompactMode::Incremental => CompactMode::Incremental,
                },
                orders: if args.orders.is_empty() {
                    None
                } else {
                    Some(args.orders.into_iter().map(Order::from).collect())
                },
                primaries: None,
                respect_readers: !args.ignore_readers,
            };
            print_json(&compact_database(&args.db, opts)?)?;
        }
        Commands::AutoCompact(args) => {
            let opts = AutoCompactOptions {
                respect_readers: !args.ignore_readers,
                ..AutoCompactOptions::default()
            };
            print_json(&auto_compact_database(&args.db, opts)?)?;
        }
        Commands::Gc(args) => {
            let opts = GcOptions { respect_readers: args.respect_readers };
            print_json(&gc_database(&args.db, opts)?)?;
        }
        Commands::Stats(args) => {
            let engine = Engine::open(&args.db)?;
            print_json(&engine.statistics()?)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
