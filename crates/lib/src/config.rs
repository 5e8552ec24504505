//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.tether/config.json`) and environment.
//! A missing file means defaults everywhere.

use crate::transport::DEFAULT_MAX_FRAME_BYTES;
use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level worker config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// What the diagnostics forwarder sends to the host.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Raw channel limits.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Diagnostics forwarding switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsConfig {
    /// Forward log output as `console` notifications (default true).
    #[serde(default = "default_true")]
    pub forward_console: bool,

    /// Forward panics and failed detached tasks as `error` notifications (default true).
    #[serde(default = "default_true")]
    pub forward_errors: bool,

    /// Most verbose log level forwarded to the host (default "info"). Overridden by TETHER_CONSOLE_LEVEL.
    #[serde(default = "default_console_level")]
    pub console_level: LevelFilter,

    /// Maximum length, in characters, of a console payload degraded to a string (default 16384).
    #[serde(default = "default_degraded_max_chars")]
    pub degraded_max_chars: usize,
}

/// Transport limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Largest encoded frame the JSON-lines sink will write (default 1 MiB).
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_console_level() -> LevelFilter {
    LevelFilter::Info
}

fn default_degraded_max_chars() -> usize {
    16 * 1024
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            forward_console: true,
            forward_errors: true,
            console_level: default_console_level(),
            degraded_max_chars: default_degraded_max_chars(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Resolve the forwarded console level: env TETHER_CONSOLE_LEVEL overrides config.
pub fn resolve_console_level(config: &Config) -> LevelFilter {
    std::env::var("TETHER_CONSOLE_LEVEL")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            match t.parse::<LevelFilter>() {
                Ok(level) => Some(level),
                Err(_) => {
                    log::warn!("ignoring invalid TETHER_CONSOLE_LEVEL {:?}", t);
                    None
                }
            }
        })
        .unwrap_or(config.diagnostics.console_level)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("TETHER_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".tether").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path, TETHER_CONFIG_PATH, or the default. Missing file => default config.
/// Environment overrides are applied. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.diagnostics.console_level = resolve_console_level(&config);
    Ok((config, path))
}
