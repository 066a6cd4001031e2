// ABOUTME: Configuration for the shutdown unmount helper.
// ABOUTME: Reads an optional TOML file naming the external tools, then applies environment overrides.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CONFIG_PATH_ENV: &str = "UNMOUNT_ALL_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/unmount-all.toml";

/// Overrides the fuser time budget. Takes a `timeout(1)` duration such as
/// `15`, `30s` or `1m`.
pub const DISCOVERY_TIMEOUT_ENV: &str = "rc_fuser_timeout";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub enumerator: String,
    pub fuser: String,
    pub timeout: String,
    pub shell: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enumerator: "mountinfo".to_string(),
            fuser: "fuser".to_string(),
            timeout: "timeout".to_string(),
            shell: "/bin/sh".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Passed to `timeout(1)` verbatim.
    pub timeout: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout: "60".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SharedConfig {
    pub mountinfo: PathBuf,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            mountinfo: PathBuf::from("/proc/1/mountinfo"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tools: ToolsConfig,
    pub discovery: DiscoveryConfig,
    pub shared: SharedConfig,
}

impl Config {
    pub fn discovery_timeout(&self) -> &str {
        &self.discovery.timeout
    }

    /// Apply the value of `rc_fuser_timeout`, if any.
    pub fn apply_timeout_override(&mut self, value: Option<&str>) {
        let Some(raw) = value else {
            return;
        };
        let trimmed = raw.trim();
        if is_timeout_duration(trimmed) {
            self.discovery.timeout = trimmed.to_string();
        } else {
            warn!(
                value = raw,
                env = DISCOVERY_TIMEOUT_ENV,
                "ignoring invalid timeout"
            );
        }
    }
}

/// True for what `timeout(1)` accepts as a duration: a non-negative number
/// with an optional `s`, `m`, `h` or `d` suffix.
pub fn is_timeout_duration(value: &str) -> bool {
    let number = value.strip_suffix(['s', 'm', 'h', 'd']).unwrap_or(value);
    number
        .parse::<f64>()
        .is_ok_and(|n| n.is_finite() && n >= 0.0)
}

pub fn parse_config(toml_str: &str) -> Result<Config> {
    let config: Config = toml::from_str(toml_str).context("failed to parse config")?;
    ensure!(
        is_timeout_duration(&config.discovery.timeout),
        "invalid discovery timeout {:?}",
        config.discovery.timeout
    );
    Ok(config)
}

/// Load the config file at `path`. A missing file gives the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_config(&content).with_context(|| format!("failed to parse {}", path.display()))
}

/// Load the config named by the environment and apply environment overrides.
pub fn load_from_env() -> Result<Config> {
    let path = std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_config(&path)?;
    config.apply_timeout_override(std::env::var(DISCOVERY_TIMEOUT_ENV).ok().as_deref());
    Ok(config)
}
