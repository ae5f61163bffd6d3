//! `keel run|stop|force|logs`: orchestrator lifecycle and logs.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;

use keel_core::ProjectName;
use keel_daemon::{request_force, request_stop, start_blocking, DaemonError};
use keel_worker::ChannelLayout;

use super::{home_dir, load_config};

#[derive(Args, Debug)]
pub struct LogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,

    /// Show this project's worker log instead of the orchestrator log.
    #[arg(long)]
    pub project: Option<String>,
}

pub fn run(config: Option<&Path>) -> Result<()> {
    let home = home_dir()?;
    start_blocking(config, &home).context("orchestrator exited with error")
}

pub fn stop() -> Result<()> {
    let home = home_dir()?;
    match request_stop(&home) {
        Ok(()) => println!("orchestrator stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("orchestrator is not running"),
        Err(err) => return Err(err).context("failed to stop orchestrator"),
    }
    Ok(())
}

pub fn force(project: &str) -> Result<()> {
    let home = home_dir()?;
    match request_force(&home, project) {
        Ok(_) => {
            println!("{project}: re-sync requested");
            Ok(())
        }
        Err(DaemonError::DaemonNotRunning { .. }) => bail!("orchestrator is not running"),
        Err(err) => Err(err).with_context(|| format!("failed to force '{project}'")),
    }
}

impl LogsArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let home = home_dir()?;
        let config = load_config(&home, config)?;

        let path = match &self.project {
            Some(project) => {
                let name = ProjectName::from(project.as_str());
                if !config.projects.iter().any(|p| p.name == name) {
                    bail!("unknown project '{project}'");
                }
                ChannelLayout::for_project(&config.state_dir_at(&home), &name).log_path()
            }
            None => match config.log_file_at(&home) {
                Some(path) => path,
                None => {
                    println!("no log_file configured; the orchestrator logs to stdout only");
                    return Ok(());
                }
            },
        };
        print_tail(&path, self.lines)
    }
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut tail = VecDeque::<String>::new();
    for line in reader.lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    println!("==> {} <==", path.display());
    for line in tail {
        println!("{line}");
    }
    Ok(())
}
