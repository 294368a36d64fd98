use std::path::Path;
use std::time::Duration;
use serde::Deserialize;
use anyhow::{ensure, Context, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub hap: HapConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HapConfig {
    /// Shared pin sent as the `Authorization` header on writes
    pub pin: String,
    /// Device identifiers to never register (matched case-insensitively)
    #[serde(default)]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_browse_window")]
    pub browse_window_secs: u64,
    #[serde(default = "default_reset_delay")]
    pub reset_delay_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_browse_window() -> u64 {
    60
}

fn default_reset_delay() -> u64 {
    6
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_listen() -> String {
    "127.0.0.1:8581".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            browse_window_secs: default_browse_window(),
            reset_delay_secs: default_reset_delay(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

impl DiscoveryConfig {
    pub fn browse_window(&self) -> Duration {
        Duration::from_secs(self.browse_window_secs)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_secs(self.reset_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_poll_interval(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Zero durations would spin timers or panic `tokio::time::interval`.
    fn validate(&self) -> Result<()> {
        ensure!(self.discovery.browse_window_secs > 0, "discovery.browse_window_secs must be greater than 0");
        ensure!(self.discovery.probe_timeout_ms > 0, "discovery.probe_timeout_ms must be greater than 0");
        ensure!(self.poll.interval_secs > 0, "poll.interval_secs must be greater than 0");
        ensure!(self.poll.request_timeout_ms > 0, "poll.request_timeout_ms must be greater than 0");
        Ok(())
    }
}
