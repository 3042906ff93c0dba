pub mod config;
pub mod servers;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use mh_domain::config::Config;

/// mcphub: one endpoint in front of many MCP tool servers.
#[derive(Debug, Parser)]
#[command(name = "mcphub", version, about)]
pub struct Cli {
    /// Path to the config file (overrides `MH_CONFIG`).
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the gateway server (default when no subcommand is given).
    Serve,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// List configured backend servers.
    Servers {
        /// Print as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Resolve the config path (`--config`, then `MH_CONFIG`, then
/// `config.toml`) and load it. A missing file yields the defaults.
///
/// Shared by `serve`, `servers` and the `config` subcommands.
pub fn load_config(explicit: Option<&str>) -> anyhow::Result<(Config, PathBuf)> {
    let config_path = explicit
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("MH_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = if config_path.exists() {
        read_config(&config_path)?
    } else {
        Config::default()
    };

    Ok((config, config_path))
}

/// Read and parse one config file.
pub fn read_config(path: &Path) -> anyhow::Result<Config> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
