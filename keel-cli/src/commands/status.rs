//! `keel status`: per-project state from the running orchestrator.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use keel_core::{TaskOutcome, TaskStatus};
use keel_daemon::paths::socket_path;
use keel_daemon::{request_status, DaemonError, DaemonStatus, ProjectSnapshot};

use super::home_dir;

/// Arguments for `keel status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct NotRunningJson {
    running: bool,
    socket: String,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "project")]
    project: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "version")]
    version: String,
    #[tabled(rename = "synced")]
    synced: String,
    #[tabled(rename = "activity")]
    activity: String,
    #[tabled(rename = "last outcome")]
    outcome: String,
    #[tabled(rename = "updated")]
    updated: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = home_dir()?;
        match request_status(&home) {
            Ok(status) if self.json => print_json(&status),
            Ok(status) => {
                print_table(&status);
                Ok(())
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                if self.json {
                    let payload = NotRunningJson {
                        running: false,
                        socket: socket_path(&home).display().to_string(),
                    };
                    print_json(&payload)
                } else {
                    println!("orchestrator is not running");
                    Ok(())
                }
            }
            Err(err) => Err(err).context("failed to query orchestrator status"),
        }
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(payload).context("failed to serialize status JSON")?
    );
    Ok(())
}

fn print_table(status: &DaemonStatus) {
    let started = DateTime::<Utc>::from_timestamp(status.started_at_unix as i64, 0)
        .map(|at| local_time(&at))
        .unwrap_or_else(|| "?".to_string());
    println!(
        "Keel v{} | {} mode | pid {} | started {} | {} projects",
        env!("CARGO_PKG_VERSION"),
        status.mode,
        status.pid,
        started,
        status.projects().len(),
    );

    if status.projects().is_empty() {
        println!("No projects running.");
        return;
    }

    let rows: Vec<StatusTableRow> = status.projects().iter().map(table_row).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for project in status.projects() {
        let Some(sync) = &project.sync else { continue };
        for error in &sync.recent_errors {
            println!("{} {}: {}", "sync error".red().bold(), project.name, error);
        }
    }
}

fn table_row(project: &ProjectSnapshot) -> StatusTableRow {
    StatusTableRow {
        project: project.name.to_string(),
        status: status_label(project.status),
        version: token(project.version.as_ref().map(|v| v.0.as_str())),
        synced: token(project.last_synced_version.as_ref().map(|v| v.0.as_str())),
        activity: activity(project),
        outcome: outcome_label(project.last_outcome.as_ref()),
        updated: local_time(&project.updated_at),
    }
}

fn activity(project: &ProjectSnapshot) -> String {
    match project.status {
        TaskStatus::Syncing => match &project.sync {
            Some(sync) if sync.total_files > 0 => format!(
                "{}/{} files, {} ({}s)",
                sync.completed_files,
                sync.total_files,
                format_bytes(sync.bytes_transferred),
                project.sync_elapsed_secs.unwrap_or_default(),
            ),
            Some(sync) => format!(
                "{} files ({}s)",
                sync.completed_files,
                project.sync_elapsed_secs.unwrap_or_default(),
            ),
            None => "starting".to_string(),
        },
        TaskStatus::Building => {
            let step = project
                .worker
                .as_ref()
                .and_then(|w| w.step())
                .unwrap_or("starting");
            format!("{step} ({}s)", project.build_elapsed_secs.unwrap_or_default())
        }
        _ => "-".to_string(),
    }
}

fn status_label(status: TaskStatus) -> String {
    let label = status.to_string().to_uppercase();
    match status {
        TaskStatus::Idle => label.bright_black().to_string(),
        TaskStatus::PendingSync | TaskStatus::PendingBuild => label.yellow().to_string(),
        TaskStatus::Syncing => label.cyan().bold().to_string(),
        TaskStatus::Building => label.blue().bold().to_string(),
    }
}

fn outcome_label(outcome: Option<&TaskOutcome>) -> String {
    match outcome {
        None => "-".to_string(),
        Some(TaskOutcome::Completed) => "completed".green().to_string(),
        Some(TaskOutcome::SyncFailed { reason }) => format!("{} {reason}", "sync failed:".red()),
        Some(TaskOutcome::BuildFailed { reason }) => {
            format!("{} {reason}", "build failed:".red())
        }
    }
}

fn token(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

fn local_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
