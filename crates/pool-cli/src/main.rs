//! # poolctl
//!
//! Administrative interface to the replica repository of one pool.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pool_config::logging::{init_logging, LogLevel};
use pool_config::{log_cli_debug, log_cli_info, Config};
use pool_repository::{AdminCommand, FileMetadataStore, LruSweeper, NullNamespace, Repository};

/// Inspect and administer a storage pool's replica repository
#[derive(Parser)]
#[command(name = "poolctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Pool base directory (holds meta/, data/ and setup.toml)
    #[arg(long = "pool-dir", env = "POOL_BASE_DIR")]
    pool_dir: Option<PathBuf>,

    /// Log level (overrides the configured one)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(flatten)]
    Admin(AdminCommand),

    /// Print the effective configuration as TOML
    Config,
}

fn open_repository(config: &Config) -> Result<Repository> {
    let base_dir = &config.pool.base_dir;
    let store = FileMetadataStore::open(base_dir)
        .with_context(|| format!("Failed to open pool directory {}", base_dir.display()))?;
    let repo = Repository::new(
        config,
        Arc::new(store),
        Arc::new(NullNamespace),
        Arc::new(LruSweeper::new()),
    );
    let files = repo.load().context("Failed to load repository")?;
    log_cli_debug!("Repository loaded", files = files);
    Ok(repo)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.pool_dir.as_deref()).context("Failed to load configuration")?;

    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(config.logging.level.as_str());
    let level: LogLevel = level.parse().map_err(anyhow::Error::msg)?;
    init_logging(level);

    let command = match cli.command {
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            return Ok(());
        }
        Commands::Admin(command) => command,
    };

    let repo = open_repository(&config)?;
    log_cli_info!("Executing command", pool = repo.pool_name());
    let result = command.execute(&repo);
    repo.shutdown();

    let output = result.context("Command rejected")?;
    if !output.is_empty() {
        print!("{}", output);
        if !output.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}
