//! Configuration file support for rerun.
//!
//! This module defines the structure of the optional `rerun.toml` file and
//! provides functionality to load and parse it. Every key is optional;
//! command-line flags take precedence over anything set here.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the configuration file looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "rerun.toml";

/// Top-level configuration structure corresponding to `rerun.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Run the test stage before building.
    pub test: Option<bool>,
    /// Run the build stage before installing.
    pub build: Option<bool>,
    /// Never start the program; only run the pipeline.
    pub no_run: Option<bool>,
    /// Pass the race detector flag to every stage.
    pub race: Option<bool>,
    /// Glob patterns matched against entry base names to exclude.
    pub ignore: Option<Vec<String>>,
    /// Also watch version-control directories such as `.git`.
    pub watch_vcs: Option<bool>,
    /// Directory to watch instead of the target's source directory.
    pub watch: Option<PathBuf>,
    /// Alternate toolchain installation root.
    pub toolchain_root: Option<PathBuf>,
    /// Toolchain command name (default: `go`).
    pub toolchain: Option<String>,
    /// Interval between two scans of the watched tree.
    pub poll_interval_ms: Option<u64>,
    /// Grace period after the interrupt before the program is killed.
    pub kill_after_ms: Option<u64>,
    /// Whether to use Unicode symbols in tool messages (default: false).
    pub symbols: Option<bool>,
    /// Whether to prepend elapsed time to tool messages.
    pub timestamp: Option<bool>,
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

/// Returns `rerun.toml` in the current directory when it exists.
pub fn default_config_path() -> Option<PathBuf> {
    let path = Path::new(DEFAULT_CONFIG_FILE);
    if path.exists() {
        Some(path.to_path_buf())
    } else {
        None
    }
}
