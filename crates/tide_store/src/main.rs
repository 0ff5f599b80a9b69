// tide-store binary: replays decreed mutations into a local fjall store and
// inspects the result.

use std::fs::File;
use std::io::{BufRead, BufReader, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tide_store::{
    CapacityUnitCounters, DecreedMutation, FjallEngine, ServerWrite, StorageEngine, StoreArgs,
    WriteService,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tide-store")]
#[command(about = "Apply and inspect decreed writes on a local tide store", long_about = None)]
struct Args {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a JSON-lines log of decreed mutations, one mutation per line.
    Apply {
        /// Log file; `-` reads stdin.
        #[arg(long, default_value = "-")]
        log: PathBuf,
        /// Skip mutations at or below the store's last committed decree.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        skip_applied: bool,
    },
    /// Print the live value of a key as UTF-8 (lossy).
    Get {
        #[arg(long)]
        hash_key: String,
        #[arg(long, default_value = "")]
        sort_key: String,
    },
    /// Print the last committed decree.
    LastDecree,
}

fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let engine = open_engine(&args.store)?;
    match args.cmd {
        Command::Apply { log, skip_applied } => apply_log(&args.store, engine, &log, skip_applied),
        Command::Get { hash_key, sort_key } => {
            let service =
                open_service(&args.store, engine, Arc::new(CapacityUnitCounters::new()))?;
            match service.get(hash_key.as_bytes(), sort_key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
            Ok(())
        }
        Command::LastDecree => {
            println!("{}", engine.last_committed_decree()?);
            Ok(())
        }
    }
}

fn open_engine(args: &StoreArgs) -> anyhow::Result<Arc<FjallEngine>> {
    let engine = FjallEngine::open_dir(&args.data_dir)
        .with_context(|| format!("open store at {}", args.data_dir.display()))?
        .with_persist_mode(match args.persist_mode {
            tide_store::PersistModeArg::Buffer => None,
            mode => Some(mode.to_fjall()),
        });
    Ok(Arc::new(engine))
}

fn open_service(
    args: &StoreArgs,
    engine: Arc<FjallEngine>,
    counters: Arc<CapacityUnitCounters>,
) -> anyhow::Result<WriteService> {
    let config = args.service_config()?;
    info!(
        cluster = %config.cluster.name,
        cluster_id = config.cluster.cluster_id,
        duplication_group = config.cluster.registry.len(),
        default_ttl_seconds = config.default_ttl_seconds,
        "opening write service"
    );
    let service = WriteService::new(engine, config, counters).context("open write service")?;
    Ok(service)
}

fn apply_log(
    args: &StoreArgs,
    engine: Arc<FjallEngine>,
    log: &Path,
    skip_applied: bool,
) -> anyhow::Result<()> {
    let counters = Arc::new(CapacityUnitCounters::new());
    let mut server = ServerWrite::new(open_service(args, engine, counters.clone())?);

    let reader: Box<dyn BufRead> = if log.as_os_str() == "-" {
        Box::new(BufReader::new(std::io::stdin()))
    } else {
        let file = File::open(log).with_context(|| format!("open log {}", log.display()))?;
        Box::new(BufReader::new(file))
    };

    let started = Instant::now();
    let mut applied = 0u64;
    let mut skipped = 0u64;
    let mut non_ok = 0u64;
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.context("read log line")?;
        if line.trim().is_empty() {
            continue;
        }
        let mutation: DecreedMutation = serde_json::from_str(&line)
            .with_context(|| format!("parse mutation on line {}", line_no + 1))?;
        if skip_applied && mutation.decree <= server.service().last_applied_decree() {
            skipped += 1;
            continue;
        }
        let responses = server
            .apply(&mutation)
            .with_context(|| format!("apply decree {}", mutation.decree))?;
        for response in responses.iter().filter(|r| !r.status().is_ok()) {
            warn!(decree = mutation.decree, status = ?response.status(), "request not applied");
            non_ok += 1;
        }
        applied += 1;
    }

    let capacity = counters.snapshot();
    info!(
        applied,
        skipped,
        non_ok,
        last_decree = server.service().last_applied_decree(),
        read_units = capacity.read_units,
        write_units = capacity.write_units,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "replayed mutation log"
    );
    Ok(())
}
