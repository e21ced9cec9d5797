mod simulate;

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use till_sync::storage::Storage;
use till_sync::{Config, PendingQueue};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "till-sync", version, about = "Offline-first write path for a point-of-sale till")]
struct Args {
    /// JSON config file (missing file means defaults)
    #[arg(long, global = true, default_value = "till-sync.json")]
    config: PathBuf,
    /// Directory holding the pending-operation journal
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk through an offline checkout, a reconnect and the drain that follows
    Simulate {
        /// Sync interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,
        /// Sales rung up while offline
        #[arg(long, default_value_t = 3)]
        sales: u32,
    },
    /// List operations waiting for the backend
    Pending,
    /// Summarize the pending queue
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::load(&args.config)?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    match args.command {
        Command::Simulate { interval_ms, sales } => {
            if let Some(ms) = interval_ms {
                config.sync_interval_ms = ms;
            }
            simulate::run(config, sales).await?
        }
        Command::Pending => pending(&config)?,
        Command::Status => status(&config)?,
    }

    Ok(())
}

fn open_queue(config: &Config) -> till_sync::Result<PendingQueue> {
    PendingQueue::open(Storage::new(&config.data_dir, "pending"), config.compact_after)
}

fn pending(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_queue(config)?;
    let operations = queue.all();
    if operations.is_empty() {
        println!("No pending operations in {}", config.data_dir.display());
        return Ok(());
    }

    println!("{:<8} {:<16} {:>8}  {:<25} LAST ERROR", "ID", "KIND", "ATTEMPTS", "CREATED");
    for op in operations {
        println!(
            "{:<8} {:<16} {:>8}  {:<25} {}",
            op.id.to_string(),
            op.kind.to_string(),
            op.attempts,
            op.created_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            op.last_error.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn status(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let queue = open_queue(config)?;
    let operations = queue.all();

    let mut per_domain: BTreeMap<String, usize> = BTreeMap::new();
    for op in &operations {
        *per_domain.entry(format!("{:?}", op.kind.domain())).or_insert(0) += 1;
    }
    let retrying = operations.iter().filter(|op| op.attempts > 0).count();

    println!("Journal:   {}", Storage::new(&config.data_dir, "pending").journal_path().display());
    println!("Pending:   {}", operations.len());
    println!("Retrying:  {retrying}");
    if let Some(oldest) = operations.first() {
        println!("Oldest:    {} ({})", oldest.created_at.to_rfc3339(), oldest.id);
    }
    for (domain, count) in per_domain {
        println!("  {domain:<10} {count}");
    }
    Ok(())
}
