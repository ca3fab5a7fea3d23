//! Configuration loading.
//!
//! Reads `config.json` from the sockmux config directory and layers
//! `SOCKMUX_*` environment overrides on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

use crate::server::DEFAULT_MAX_PENDING;

/// Configuration for the sockmux daemon.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Interface to bind.
    pub host: String,
    /// Port to bind. `0` picks an ephemeral port.
    pub port: u16,
    /// Listen backlog.
    pub max_pending: u32,
    /// Frame transport messages with a length prefix. Multiplexing needs this.
    pub message_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7700,
            max_pending: DEFAULT_MAX_PENDING,
            message_mode: true,
        }
    }
}

impl Config {
    /// Returns the configuration directory path.
    ///
    /// `SOCKMUX_CONFIG_DIR` wins; otherwise the platform config dir
    /// (e.g. `~/.config/sockmux` on Linux).
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("SOCKMUX_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("sockmux"))
    }

    /// Loads `config.json` from [`Config::config_dir`], with environment
    /// overrides. A missing file yields the defaults.
    pub fn load() -> Result<Self> {
        let path = Self::config_dir()?.join("config.json");
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            log::debug!("No config at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads an explicit config file. No environment overrides are applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Applies `SOCKMUX_HOST`, `SOCKMUX_PORT`, `SOCKMUX_MAX_PENDING` and
    /// `SOCKMUX_MESSAGE_MODE`. Unparseable values are ignored.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("SOCKMUX_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("SOCKMUX_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.port = port,
                Err(_) => log::warn!("Ignoring invalid SOCKMUX_PORT: {port}"),
            }
        }

        if let Some(max_pending) = lookup("SOCKMUX_MAX_PENDING") {
            match max_pending.parse::<u32>() {
                Ok(max) if max > 0 => self.max_pending = max,
                _ => log::warn!("Ignoring invalid SOCKMUX_MAX_PENDING: {max_pending}"),
            }
        }

        if let Some(mode) = lookup("SOCKMUX_MESSAGE_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.message_mode = true,
                "0" | "false" | "no" => self.message_mode = false,
                _ => log::warn!("Ignoring invalid SOCKMUX_MESSAGE_MODE: {mode}"),
            }
        }
    }

    /// `host:port`, ready for [`TcpServer::bind`](crate::TcpServer::bind).
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
