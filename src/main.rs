use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pg2parquet::{RunOutcome, RuntimeConfig};
use std::path::PathBuf;
use tracing::info;

/// Incremental Postgres extraction to partitioned Parquet on object storage
#[derive(Parser)]
#[command(name = "pg2parquet")]
#[command(version)]
#[command(about = "Incremental Postgres extraction to partitioned Parquet on object storage", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn, error
    #[arg(short = 'v', long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    /// Watermark state file (overrides config file)
    #[arg(long, value_name = "PATH", global = true)]
    state_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one extraction cycle (default if no subcommand given)
    Run {
        /// Write partitions locally but skip uploads and the watermark commit
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the stored watermark
    Watermark,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command {
        Some(Commands::Watermark) => print_watermark(&config),
        Some(Commands::Run { dry_run }) => run(config, dry_run),
        None => run(config, false),
    }
}

fn load_config(cli: &Cli) -> Result<RuntimeConfig> {
    let mut config = if let Some(config_path) = &cli.config {
        RuntimeConfig::load_from_path(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        RuntimeConfig::load().context("Failed to load configuration")?
    };

    // CLI overrides (highest priority)
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(state_file) = &cli.state_file {
        config.state.path = state_file.to_string_lossy().to_string();
    }

    Ok(config)
}

fn print_watermark(config: &RuntimeConfig) -> Result<()> {
    let store = pg2parquet::init_store(&config.state);
    let watermark = store
        .read()
        .with_context(|| format!("Failed to read watermark from {}", store.describe()))?;
    println!("{}", watermark);
    Ok(())
}

fn run(config: RuntimeConfig, dry_run: bool) -> Result<()> {
    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(pg2parquet::run_with_config(config, dry_run))
        .context("Extraction run failed")?;

    match outcome {
        RunOutcome::NoNewRows { watermark } => {
            info!(watermark = %watermark, "Run finished without new rows");
        }
        RunOutcome::NoValidRows {
            rows_extracted,
            watermark,
        } => {
            info!(
                rows_extracted,
                watermark = %watermark,
                "Run finished without valid rows"
            );
        }
        RunOutcome::Completed(summary) => {
            info!(
                run_id = %summary.run_id,
                rows_extracted = summary.rows_extracted,
                rows_written = summary.rows_written,
                files = summary.uploads.len(),
                dry_run = summary.dry_run,
                "Run complete: {} -> {}",
                summary.previous_watermark,
                summary.watermark
            );
        }
    }

    Ok(())
}
