//! CLI argument definitions for the `mnemo` maintenance tool.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use mnemo_core::types::SearchMode;

/// Mnemo: inspect and maintain memory engine snapshots.
#[derive(Parser, Debug)]
#[command(name = "mnemo", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print engine statistics for a snapshot.
    Stats {
        snapshot: PathBuf,
    },
    /// Run one consolidation pass over a snapshot.
    Consolidate {
        snapshot: PathBuf,
        /// Where to write the consolidated snapshot. Defaults to in place.
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Report what would happen without writing anything.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Apply the forgetting curve to a snapshot.
    Decay {
        snapshot: PathBuf,
        /// Half-life in days. Defaults to the configured value.
        #[arg(long = "half-life-days")]
        half_life_days: Option<f64>,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
    },
    /// Nearest-neighbor query against a snapshot.
    Query {
        snapshot: PathBuf,
        /// Comma-separated query vector.
        #[arg(long = "vector", value_delimiter = ',', required = true, allow_negative_numbers = true)]
        vector: Vec<f32>,
        #[arg(short = 'k', default_value_t = 10)]
        k: usize,
        /// exact or approximate. Defaults to the configured strategy.
        #[arg(short = 'm', long = "mode")]
        mode: Option<SearchMode>,
    },
    /// Remove expired entries from an on-disk cache directory.
    CacheSweep {
        dir: PathBuf,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > MNEMO_CONFIG env var > ~/.mnemo/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("MNEMO_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".mnemo").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".mnemo").join("config.toml");
    }
    PathBuf::from("config.toml")
}
