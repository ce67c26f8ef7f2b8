//! beaconindex CLI — inspect a beacon-chain index database.
//!
//! Usage:
//! ```bash
//! beaconindex status        --db ./index.db [--handler beaconcommittees.standard]
//! beaconindex empty-slots   --db ./index.db 100 105
//! beaconindex indeterminate --db ./index.db 100 200
//! beaconindex blocks        --db ./index.db 416
//! beaconindex info
//! ```

use std::env;
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context};

use beaconindex_committees::ServiceBuilder;
use beaconindex_core::logging::{init_tracing, LogConfig};
use beaconindex_core::progress::ProgressManager;
use beaconindex_core::store::BlockStore;
use beaconindex_core::types::Slot;
use beaconindex_storage::sqlite::SqliteStorage;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    init_tracing(&LogConfig {
        json: env::var("BEACONINDEX_LOG_JSON").is_ok(),
        ..LogConfig::default()
    });

    let rest = &args[2..];
    let result = match args[1].as_str() {
        "info" => {
            cmd_info();
            Ok(())
        }
        "status" => cmd_status(rest).await,
        "empty-slots" => cmd_empty_slots(rest).await,
        "indeterminate" => cmd_indeterminate(rest).await,
        "blocks" => cmd_blocks(rest).await,
        "version" | "--version" | "-V" => {
            println!("beaconindex {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            print_usage();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    println!("beaconindex {}", env!("CARGO_PKG_VERSION"));
    println!("Beacon-chain committee indexer and canonical block store\n");
    println!("USAGE:");
    println!("    beaconindex <COMMAND> [--db <PATH>] [ARGS]\n");
    println!("COMMANDS:");
    println!("    info                         Show default configuration");
    println!("    status                       Show progress of a handler [--handler <ID>]");
    println!("    empty-slots <MIN> <MAX>      Slots in [MIN, MAX] without a stored block");
    println!("    indeterminate <MIN> <MAX>    Roots in [MIN, MAX) whose canonicality is unknown");
    println!("    blocks <SLOT>                Blocks stored at SLOT (JSON)");
    println!("    version                      Print version");
    println!("    help                         Print this help");
}

fn cmd_info() {
    let cfg = ServiceBuilder::new().build_config();
    println!("BeaconIndex v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default handler: {}", cfg.handler_id);
    println!("  Slots per epoch: {}", cfg.slots_per_epoch);
    println!("  Seconds per slot: {}", cfg.seconds_per_slot);
    println!("  Commit mode: {:?}", cfg.commit_mode);
    println!("  Storage backends: memory, SQLite, PostgreSQL (feature: postgres)");
}

async fn cmd_status(args: &[String]) -> anyhow::Result<()> {
    let opts = Opts::parse(args)?;
    let store = opts.open().await?;
    let handler = opts
        .handler
        .unwrap_or_else(|| ServiceBuilder::new().build_config().handler_id);
    let md = ProgressManager::new(Arc::new(store), handler.clone())
        .load()
        .await?;

    println!("handler:              {handler}");
    match md.last_processed_epoch {
        Some(epoch) => println!("last processed epoch: {epoch}"),
        None => println!("last processed epoch: (none)"),
    }
    if let Some(ts) = chrono::DateTime::from_timestamp(md.updated_at, 0).filter(|_| md.updated_at > 0) {
        println!("updated at:           {}", ts.to_rfc3339());
    }
    Ok(())
}

async fn cmd_empty_slots(args: &[String]) -> anyhow::Result<()> {
    let opts = Opts::parse(args)?;
    let (min, max) = opts.range()?;
    let store = opts.open().await?;
    for slot in store.empty_slots(min, max).await? {
        println!("{slot}");
    }
    Ok(())
}

async fn cmd_indeterminate(args: &[String]) -> anyhow::Result<()> {
    let opts = Opts::parse(args)?;
    let (min, max) = opts.range()?;
    let store = opts.open().await?;
    for root in store.indeterminate_blocks(min, max).await? {
        println!("{root}");
    }
    Ok(())
}

async fn cmd_blocks(args: &[String]) -> anyhow::Result<()> {
    let opts = Opts::parse(args)?;
    let [slot] = opts.slots::<1>()?;
    let store = opts.open().await?;
    let blocks = store.blocks_by_slot(slot).await?;
    println!("{}", serde_json::to_string_pretty(&blocks)?);
    Ok(())
}

/// Parsed command arguments.
#[derive(Debug, Default, PartialEq)]
struct Opts {
    db: Option<String>,
    handler: Option<String>,
    positional: Vec<String>,
}

impl Opts {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut opts = Opts::default();
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--db" => opts.db = Some(it.next().context("--db needs a path")?.clone()),
                "--handler" => {
                    opts.handler = Some(it.next().context("--handler needs an id")?.clone())
                }
                flag if flag.starts_with("--") => bail!("unknown flag {flag}"),
                _ => opts.positional.push(arg.clone()),
            }
        }
        Ok(opts)
    }

    fn slots<const N: usize>(&self) -> anyhow::Result<[Slot; N]> {
        if self.positional.len() != N {
            bail!("expected {N} slot argument(s), got {}", self.positional.len());
        }
        let mut slots = [0; N];
        for (slot, raw) in slots.iter_mut().zip(&self.positional) {
            *slot = raw.parse().with_context(|| format!("invalid slot {raw:?}"))?;
        }
        Ok(slots)
    }

    fn range(&self) -> anyhow::Result<(Slot, Slot)> {
        let [min, max] = self.slots::<2>()?;
        if min > max {
            bail!("min slot {min} is above max slot {max}");
        }
        Ok((min, max))
    }

    async fn open(&self) -> anyhow::Result<SqliteStorage> {
        let path = self.db.as_deref().unwrap_or("./beaconindex.db");
        tracing::debug!(path, "Opening index database");
        SqliteStorage::open(path)
            .await
            .with_context(|| format!("failed to open {path}"))
    }
}
