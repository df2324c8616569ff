//! Stack Backup/Restore Tool
//!
//! Provides CLI interface for snapshotting and restoring a web application's
//! installation directory, data directory and database.

// stackvault/src/main.rs
mod backup;
mod config;
mod coordinator;
mod database;
mod errors;
mod restore;
mod retention;
mod secrets;
mod service;
#[cfg(test)]
mod testing;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use config::StackConfig;
use coordinator::lease::SnapshotLease;
use coordinator::snapshot::missing_artifacts;
use errors::AppError;

const EXIT_PARTIAL: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "stackvault", version, about = "Backup and restore a web application stack")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "STACKVAULT_CONFIG", default_value = "config.json", global = true)]
    config: PathBuf,

    /// Log debug detail to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Take a new snapshot of the installation, data directory and database
    Backup,
    /// Replace the live stack with a snapshot
    Restore {
        /// Snapshot identifier, e.g. 20210327_200514
        snapshot_id: String,
    },
    /// List snapshots, newest first
    List,
    /// Delete all but the newest snapshots
    Prune {
        /// Number of snapshots to keep (defaults to the configured retention)
        #[arg(short, long)]
        keep: Option<usize>,
    },
}

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run_app(cli).await {
        Ok(code) => code,
        Err(e) => {
            // A cancelled run stays cancelled even when its cleanup also failed.
            if let Some(err) = e.downcast_ref::<AppError>() {
                if matches!(err.root_cause(), AppError::Cancelled { .. }) {
                    eprintln!("⚠ {}", err);
                    return ExitCode::from(EXIT_CANCELLED);
                }
            }
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_app(cli: Cli) -> Result<ExitCode> {
    let config = StackConfig::load_from_json(&cli.config)
        .context(format!("Failed to load configuration from {}", cli.config.display()))?;
    tracing::debug!(config = %cli.config.display(), engine = %config.database_engine, "configuration loaded");

    let command = match cli.command {
        Some(command) => command,
        None => prompt_choice()?,
    };

    match command {
        Command::Backup => {
            println!("🚀 Starting Backup Process...");
            let report = backup::run_backup_flow(&config).await.context("Backup process failed")?;
            if !report.is_complete() {
                eprintln!("⚠ Backup finished with missing artifacts; snapshot {} is partial.", report.snapshot_id);
                return Ok(ExitCode::from(EXIT_PARTIAL));
            }
        }
        Command::Restore { snapshot_id } => {
            println!("🔄 Starting Restore Process...");
            println!("Restore source: {}", config.snapshot_root.join(&snapshot_id).display());
            restore::run_restore_flow(&config, &snapshot_id)
                .await
                .context("Restore process failed")?;
        }
        Command::List => list_snapshots(&config)?,
        Command::Prune { keep } => prune_snapshots(&config, keep.unwrap_or(config.retention))?,
    }
    println!("✅ Operation completed successfully.");
    Ok(ExitCode::SUCCESS)
}

fn list_snapshots(config: &StackConfig) -> Result<()> {
    if !config.snapshot_root.is_dir() {
        println!("No snapshots under {}", config.snapshot_root.display());
        return Ok(());
    }
    let snapshots = retention::list_snapshots(&config.snapshot_root)
        .with_context(|| format!("Failed to read {}", config.snapshot_root.display()))?;
    if snapshots.is_empty() {
        println!("No snapshots under {}", config.snapshot_root.display());
    }
    for snapshot in snapshots {
        let missing = missing_artifacts(&snapshot.path, &config.artifacts);
        if missing.is_empty() {
            println!("{}  complete", snapshot.name);
        } else {
            println!("{}  incomplete (missing: {})", snapshot.name, missing.join(", "));
        }
    }
    Ok(())
}

fn prune_snapshots(config: &StackConfig, keep: usize) -> Result<()> {
    if keep == 0 {
        println!("ℹ Retention is unlimited; nothing to prune.");
        return Ok(());
    }
    let _lease = SnapshotLease::acquire(&config.snapshot_root)?;
    let report = retention::prune(&config.snapshot_root, keep)
        .with_context(|| format!("Failed to prune {}", config.snapshot_root.display()))?;
    for path in &report.removed {
        println!("🗑 Removed {}", path.display());
    }
    println!("Kept {} snapshot(s).", report.kept.len());
    if !report.failed.is_empty() {
        for (path, error) in &report.failed {
            eprintln!("❌ Could not remove {}: {}", path.display(), error);
        }
        anyhow::bail!("{} snapshot(s) could not be removed", report.failed.len());
    }
    Ok(())
}

/// Prompts user to select an operation when none was given on the command line
fn prompt_choice() -> Result<Command> {
    use std::io::{stdin, stdout, Write};

    println!("Select an operation:");
    println!("1. Take Backup (or type 'backup')");
    println!("2. Restore Backup (or type 'restore')");
    println!("3. List Snapshots (or type 'list')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    match input.trim() {
        "1" | "backup" => Ok(Command::Backup),
        "2" | "restore" => {
            print!("Snapshot identifier: ");
            stdout().flush().context("Failed to flush stdout")?;
            let mut id = String::new();
            stdin().read_line(&mut id).context("Failed to read user input")?;
            Ok(Command::Restore { snapshot_id: id.trim().to_string() })
        }
        "3" | "list" => Ok(Command::List),
        _ => {
            println!("❌ Invalid choice. Please enter '1' (backup), '2' (restore), or '3' (list).");
            anyhow::bail!("Invalid operation choice");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_restore_and_prune() {
        let cli = Cli::parse_from(["stackvault", "--config", "/etc/stackvault.json", "restore", "20210327_200514"]);
        assert_eq!(cli.config, PathBuf::from("/etc/stackvault.json"));
        assert!(matches!(cli.command, Some(Command::Restore { ref snapshot_id }) if snapshot_id == "20210327_200514"));

        let cli = Cli::parse_from(["stackvault", "prune", "--keep", "3", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Some(Command::Prune { keep: Some(3) })));
    }
}
