//! `voxcache` operator CLI: inspect, prune, clear and move a clip cache database.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing::error;

use voxcache::limits::{CacheLimitsOverrides, ConfigError};
use voxcache::{
    export_archive, import_archive, init_tracing, ArchiveError, CacheConfig, CacheError,
    ClipCache,
};

const DEFAULT_DB: &str = "voxcache.db";

#[derive(Parser)]
#[command(name = "voxcache")]
#[command(about = "Inspect and maintain a synthesized speech clip cache", long_about = None)]
#[command(version)]
struct Cli {
    /// SQLite database file. Overrides the config file and VOXCACHE_DB.
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    /// JSON config file ({"dbPath", "limits": {...}}).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print entry count, total bytes and limits.
    Stats,
    /// Recompute the summary from a full scan.
    Reconcile,
    /// Run one eviction pass.
    Prune,
    /// Remove every clip.
    Clear,
    /// Show limits, or change them when any flag is given.
    Limits {
        #[arg(long)]
        max_entries: Option<u64>,
        #[arg(long)]
        max_bytes: Option<u64>,
        #[arg(long)]
        ttl_secs: Option<u64>,
    },
    /// Write every live clip to a .tar.gz archive.
    Export { file: PathBuf },
    /// Add clips from an archive; existing keys are never overwritten.
    Import { file: PathBuf },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("{path}: {source}")]
    File {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("voxcache: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::load_from_file(path)?,
        None => CacheConfig::default(),
    }
    .with_env();
    if let Some(db) = cli.db {
        config.db_path = Some(db);
    }
    if config.db_path.is_none() {
        config.db_path = Some(PathBuf::from(DEFAULT_DB));
    }

    let cache = ClipCache::open(&config).await?;

    match cli.command {
        Command::Stats => {
            let summary = cache.summary().await;
            print_json(&serde_json::json!({
                "available": cache.is_available(),
                "summary": summary,
                "limits": cache.limits(),
            }))?;
        }
        Command::Reconcile => {
            let summary = cache.reconcile().await?;
            print_json(&summary)?;
        }
        Command::Prune => {
            let report = cache.prune().await?;
            println!(
                "removed {} ({} expired), freed {} bytes; {} entries / {} bytes remain",
                report.removed,
                report.expired,
                report.freed_bytes,
                report.remaining_entries,
                report.remaining_bytes
            );
        }
        Command::Clear => {
            cache.clear().await?;
            println!("cache cleared");
        }
        Command::Limits {
            max_entries,
            max_bytes,
            ttl_secs,
        } => {
            let overrides = CacheLimitsOverrides {
                max_entries,
                max_bytes,
                ttl_secs,
            };
            if !overrides.is_empty() {
                cache.set_limits(cache.limits().apply(&overrides)).await?;
                cache.prune().await?;
            }
            print_json(&cache.limits())?;
        }
        Command::Export { file } => {
            let out = File::create(&file).map_err(|source| CliError::File {
                path: file.clone(),
                source,
            })?;
            let mut writer = BufWriter::new(out);
            let report = export_archive(&cache, &mut writer, |_| {}).await?;
            writer.flush().map_err(|source| CliError::File {
                path: file.clone(),
                source,
            })?;
            println!(
                "exported {} clips ({} bytes) to {}",
                report.entries,
                report.bytes,
                file.display()
            );
        }
        Command::Import { file } => {
            let input = File::open(&file).map_err(|source| CliError::File {
                path: file.clone(),
                source,
            })?;
            let report = import_archive(&cache, BufReader::new(input), |_| {}).await?;
            println!(
                "imported {} clips ({} bytes), skipped {} already present",
                report.added, report.bytes, report.skipped
            );
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
