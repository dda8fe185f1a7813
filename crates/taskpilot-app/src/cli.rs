//! CLI argument definitions for the TaskPilot server.
//!
//! Priority resolution: CLI args > `TASKPILOT_*` env vars > config file > defaults.

use clap::Parser;
use std::path::PathBuf;

use taskpilot_core::config::TaskPilotConfig;

/// TaskPilot: runs goals as planned, supervised tasks behind an HTTP API.
#[derive(Parser, Debug)]
#[command(name = "taskpilot", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// API server port.
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Data directory for the SQLite database, vault key and API token.
    #[arg(short = 'd', long = "data-dir")]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level")]
    pub log_level: Option<String>,

    /// Write the effective configuration to the config path and exit.
    #[arg(long = "write-config")]
    pub write_config: bool,
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TASKPILOT_CONFIG env var > ~/.taskpilot/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        self.resolve_config_path_with(|k| std::env::var(k).ok())
    }

    fn resolve_config_path_with(&self, env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Some(p) = env("TASKPILOT_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Fold flag and environment overrides into a loaded config.
    pub fn apply(&self, config: &mut TaskPilotConfig) {
        self.apply_with(config, |k| std::env::var(k).ok());
    }

    fn apply_with(&self, config: &mut TaskPilotConfig, env: impl Fn(&str) -> Option<String>) {
        if let Some(port) = self
            .port
            .or_else(|| env("TASKPILOT_PORT").and_then(|v| v.parse::<u16>().ok()))
        {
            config.general.port = port;
        }
        if config.general.port == 0 {
            config.general.port = 3030;
        }

        if let Some(dir) = self
            .data_dir
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .or_else(|| env("TASKPILOT_DATA_DIR"))
        {
            config.general.data_dir = dir;
        }

        if let Some(level) = self.log_level.clone().or_else(|| env("TASKPILOT_LOG_LEVEL")) {
            config.general.log_level = level;
        }

        if let Some(token) = env("TASKPILOT_API_TOKEN").filter(|t| !t.trim().is_empty()) {
            config.general.api_token = Some(token.trim().to_string());
        }
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".taskpilot").join("config.toml");
    }
    PathBuf::from("config.toml")
}
