//! `keel check`: load and validate the configuration.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use keel_core::config::{Severity, ValidationReport};
use keel_core::{BackendMode, Config};
use keel_detector::backend_for;

use super::{home_dir, load_config};

/// Arguments for `keel check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Emit the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckArgs {
    pub fn run(self, config: Option<&Path>) -> Result<()> {
        let home = home_dir()?;
        let config = load_config(&home, config)?;

        let mut report = config.validate();
        if config.mode == BackendMode::Live && report.is_ok() {
            if let Err(err) = backend_for(&config).check_connection() {
                report.push_error(format!("Perforce is not reachable: {err}"));
            }
        }

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize report")?
            );
        } else {
            print_report(&config, &report);
        }

        let errors = report.errors().count();
        if errors > 0 {
            bail!("configuration has {errors} error(s)");
        }
        Ok(())
    }
}

fn print_report(config: &Config, report: &ValidationReport) {
    for issue in &report.issues {
        let label = match issue.severity {
            Severity::Error => "error".red().bold(),
            Severity::Warning => "warning".yellow().bold(),
        };
        println!("{label}: {issue}");
    }

    if report.is_ok() {
        println!(
            "{} {} project(s), {} mode",
            "configuration OK:".green().bold(),
            config.projects.len(),
            config.mode,
        );
    }
}
