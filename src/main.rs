use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use ledgerbox_lib::backup::scheduler::BackupScheduler;
use ledgerbox_lib::backup::{BackupOutcome, BackupReport, BackupStatus};
use ledgerbox_lib::config::{BackupConfig, HostRoots};
use ledgerbox_lib::{BackupCoordinator, BackupTag};

#[derive(Debug, Parser)]
#[command(name = "ledgerbox", about = "ledgerbox database snapshot backups", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show the primary database and every backup destination.
    Status {
        /// Emit the raw JSON status report.
        #[arg(long)]
        json: bool,
    },
    /// Take a snapshot now.
    Backup {
        /// Label recorded in the snapshot name and the backup log.
        #[arg(long, default_value = "manual")]
        tag: BackupTag,
        /// Emit the outcome as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Replace the primary database with a snapshot. An emergency backup of
    /// the current database is taken first.
    Restore {
        /// Snapshot file to restore.
        path: PathBuf,
        /// Emit the restore report as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Run the startup and recurring backup timers until interrupted.
    Watch,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logs_dir = HostRoots::resolve().ok().map(|roots| roots.logs_dir());
    if let Err(err) = ledgerbox_lib::init_logging(logs_dir.as_deref()) {
        eprintln!("Warning: {err:#}");
    }

    let code = match run(cli.command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            1
        }
    };
    ledgerbox_lib::flush_file_logs();
    process::exit(code);
}

async fn run(command: Command) -> Result<i32> {
    let config = BackupConfig::from_env().context("load backup configuration")?;
    let coordinator = BackupCoordinator::new(config).context("create backup coordinator")?;

    match command {
        Command::Status { json } => {
            let status = coordinator.backup_status();
            if json {
                print_json(&status)?;
            } else {
                print_status(&status);
            }
            Ok(0)
        }
        Command::Backup { tag, json } => {
            let outcome = coordinator.create_backup(tag).await;
            if json {
                print_json(&outcome)?;
            } else {
                print_outcome(&outcome);
            }
            Ok(if outcome.succeeded() { 0 } else { 1 })
        }
        Command::Restore { path, json } => match coordinator.restore_from_backup(&path).await {
            Ok(report) => {
                if json {
                    print_json(&report)?;
                } else {
                    if let Some(emergency) = &report.emergency_backup {
                        println!("Emergency backup: {}", emergency.file_name);
                    }
                    println!(
                        "Restored {} ({} bytes) to {}",
                        report.snapshot_path, report.restored_bytes, report.database_path
                    );
                }
                Ok(0)
            }
            Err(err) => {
                eprintln!("Restore failed: {err}");
                Ok(1)
            }
        },
        Command::Watch => watch(coordinator).await,
    }
}

async fn watch(coordinator: BackupCoordinator) -> Result<i32> {
    let coordinator = Arc::new(coordinator);
    let scheduler = BackupScheduler::start(coordinator.clone());
    println!(
        "Watching {} (Ctrl-C to stop)",
        coordinator.config().primary_path.display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;

    let outcome = scheduler.shutdown_with_final_backup().await;
    print_outcome(&outcome);
    Ok(0)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn print_outcome(outcome: &BackupOutcome) {
    match outcome {
        BackupOutcome::AlreadyRunning => println!("Another backup is already running."),
        BackupOutcome::SourceUnavailable { path } => {
            println!("Nothing to back up: {path} is missing or empty.")
        }
        BackupOutcome::Completed(report) => print_report(report),
    }
}

fn print_report(report: &BackupReport) {
    for dest in &report.destinations {
        match &dest.error {
            None => println!("ok      {}", dest.path),
            Some(err) => println!("failed  {} ({})", dest.path, err.message()),
        }
    }
    println!(
        "Backup {} [{}] stored in {}/{} destinations",
        report.file_name, report.tag, report.succeeded, report.total
    );
}

fn print_status(status: &BackupStatus) {
    println!("Backup status");
    println!("Database     : {}", status.primary.path);
    if status.primary.exists {
        println!("Size         : {} bytes", status.primary.size_bytes);
    } else {
        println!("Size         : missing");
    }
    println!("In progress  : {}", if status.in_flight { "yes" } else { "no" });
    println!("Keep newest  : {}", status.retention_max_count);

    println!("\nDestinations:");
    println!("{:<8} {:<50} Latest", "Count", "Directory");
    for dest in &status.destinations {
        let latest = dest
            .latest_backup
            .as_ref()
            .map(|latest| format!("{} ({})", latest.name, latest.modified_at))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<8} {:<50} {}", dest.snapshot_count, dest.directory, latest);
    }
}
