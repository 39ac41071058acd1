//! histcache CLI: inspect and clear persisted cache records.
//!
//! Commands:
//! - `status`: list records with their kind, rows, progress and size
//! - `clear`: remove records by key, by age, or all of them (dry run unless `--confirm`)

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{Parser, Subcommand};
use histcache_core::{default_root, CacheKey, CacheSettings, CacheStore, ParquetStore, StoredRecordInfo};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "histcache", about = "Inspect and clear histcache records")]
struct Cli {
    /// Cache root directory. Overrides the settings file.
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Settings file (TOML) to read the cache root from.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List persisted records.
    Status,

    /// Remove persisted records.
    Clear {
        /// Record keys to remove.
        keys: Vec<String>,

        /// Remove every record.
        #[arg(long, default_value_t = false, conflicts_with = "keys")]
        all: bool,

        /// Remove records not updated within this many days.
        #[arg(long, conflicts_with_all = ["keys", "all"])]
        older_than_days: Option<u64>,

        /// Actually delete (without this flag, only shows what would be deleted).
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let root = resolve_root(cli.root, cli.config.as_deref())?;
    debug!(root = %root.display(), "using cache root");
    let store = ParquetStore::new(root);

    match cli.command {
        Commands::Status => run_status(&store),
        Commands::Clear {
            keys,
            all,
            older_than_days,
            confirm,
        } => run_clear(&store, keys, all, older_than_days, confirm),
    }
}

fn resolve_root(root: Option<PathBuf>, config: Option<&Path>) -> Result<PathBuf> {
    if let Some(root) = root {
        return Ok(root);
    }
    match config {
        Some(path) => {
            let settings = CacheSettings::from_file(path)
                .with_context(|| format!("loading settings from {}", path.display()))?;
            Ok(settings.root)
        }
        None => Ok(default_root()),
    }
}

fn run_status(store: &ParquetStore) -> Result<()> {
    let root = store.root();
    if !root.exists() {
        println!("Cache directory does not exist: {}", root.display());
        return Ok(());
    }

    let records = store
        .list()
        .with_context(|| format!("listing records in {}", root.display()))?;
    if records.is_empty() {
        println!("Cache is empty: {}", root.display());
        return Ok(());
    }

    let total_size: u64 = records.iter().map(|r| dir_size(Path::new(&r.location))).sum();
    println!("Cache: {}", root.display());
    println!("Records: {}", records.len());
    println!("Total size: {}", format_size(total_size));
    println!();
    println!(
        "{:<40} {:<10} {:>8} {:<28} {:>4} {:<20} {:>10}",
        "Key", "Kind", "Rows", "Progress", "Gen", "Saved", "Size"
    );
    println!("{}", "-".repeat(128));

    for record in &records {
        let size = format_size(dir_size(Path::new(&record.location)));
        match &record.summary {
            Ok(s) => {
                let progress = match s.kind {
                    "ids" => format!("{} ids", s.fetched),
                    _ => match &s.boundary {
                        Some(b) => format!("through {b}"),
                        None => "(none)".to_string(),
                    },
                };
                println!(
                    "{:<40} {:<10} {:>8} {:<28} {:>4} {:<20} {:>10}",
                    record.key,
                    s.kind,
                    s.row_count,
                    progress,
                    s.generation,
                    s.saved_at.format("%Y-%m-%d %H:%M:%S"),
                    size
                );
            }
            Err(reason) => {
                println!("{:<40} (unreadable: {reason}) {size:>10}", record.key);
            }
        }
    }

    Ok(())
}

fn run_clear(
    store: &ParquetStore,
    keys: Vec<String>,
    all: bool,
    older_than_days: Option<u64>,
    confirm: bool,
) -> Result<()> {
    let records = store.list().context("listing records")?;

    let selected: Vec<&StoredRecordInfo> = if all {
        records.iter().collect()
    } else if let Some(days) = older_than_days {
        let cutoff = age_cutoff(Utc::now(), days)?;
        records
            .iter()
            .filter(|r| matches!(&r.summary, Ok(s) if s.saved_at < cutoff))
            .collect()
    } else if !keys.is_empty() {
        let mut selected = Vec::with_capacity(keys.len());
        for raw in &keys {
            let key = CacheKey::parse(raw)?;
            match records.iter().find(|r| r.key == key) {
                Some(record) => selected.push(record),
                None => println!("No record named {key}"),
            }
        }
        selected
    } else {
        bail!("name the records to clear, or pass --all or --older-than-days");
    };

    if selected.is_empty() {
        println!("Nothing to remove.");
        return Ok(());
    }

    println!("Found {} record(s) to remove:", selected.len());
    for record in &selected {
        println!(
            "  {} ({})",
            record.key,
            format_size(dir_size(Path::new(&record.location)))
        );
    }

    if !confirm {
        println!();
        println!("Dry run: pass --confirm to actually delete.");
        return Ok(());
    }

    for record in &selected {
        store
            .remove(&record.key)
            .with_context(|| format!("removing {}", record.key))?;
        println!("Removed: {}", record.key);
    }

    println!("Done. Removed {} record(s).", selected.len());
    Ok(())
}

/// `now` minus `days`, rejecting ages the calendar cannot represent.
fn age_cutoff(now: DateTime<Utc>, days: u64) -> Result<DateTime<Utc>> {
    i64::try_from(days)
        .ok()
        .and_then(TimeDelta::try_days)
        .and_then(|age| now.checked_sub_signed(age))
        .with_context(|| format!("--older-than-days {days} is out of range"))
}

fn dir_size(path: &Path) -> u64 {
    let mut size = 0u64;
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                size += meta.len();
            }
        }
    }
    size
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
