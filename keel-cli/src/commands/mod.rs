pub mod check;
pub mod daemon;
pub mod status;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use keel_core::{config, Config};

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Load `--config` if given, else `~/.keel/config.yaml`.
pub(crate) fn load_config(home: &Path, path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => config::load_default_at(home).with_context(|| {
            format!(
                "failed to load {}",
                config::default_config_path_at(home).display()
            )
        }),
    }
}
