//! Configuration for the dispatcher and compensation scanner.

use crate::RelayResult;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default dispatcher batch size.
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 100;

/// Default maximum publish attempts before a message is marked failed.
pub const DEFAULT_MAX_RETRY: u32 = 5;

/// Default dispatcher poll interval in seconds.
pub const DEFAULT_DISPATCH_POLL_SECONDS: u64 = 5;

/// Default compensation scanner batch size.
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 50;

/// Default compensation scanner poll interval in seconds.
pub const DEFAULT_SCAN_POLL_SECONDS: u64 = 60;

/// Dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Maximum pending rows fetched per dispatch cycle.
    #[serde(default = "default_dispatch_batch_size")]
    pub batch_size: usize,
    /// Publish attempts before a message transitions to failed.
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,
    /// Sleep between dispatch cycles.
    #[serde(default = "default_dispatch_poll_seconds")]
    pub poll_interval_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            max_retry: DEFAULT_MAX_RETRY,
            poll_interval_seconds: DEFAULT_DISPATCH_POLL_SECONDS,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

/// Compensation scanner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Maximum failed rows fetched per side per scan cycle.
    #[serde(default = "default_scan_batch_size")]
    pub batch_size: usize,
    /// Sleep between scan cycles.
    #[serde(default = "default_scan_poll_seconds")]
    pub poll_interval_seconds: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SCAN_BATCH_SIZE,
            poll_interval_seconds: DEFAULT_SCAN_POLL_SECONDS,
        }
    }
}

impl ScannerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }
}

fn default_dispatch_batch_size() -> usize {
    DEFAULT_DISPATCH_BATCH_SIZE
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_dispatch_poll_seconds() -> u64 {
    DEFAULT_DISPATCH_POLL_SECONDS
}

fn default_scan_batch_size() -> usize {
    DEFAULT_SCAN_BATCH_SIZE
}

fn default_scan_poll_seconds() -> u64 {
    DEFAULT_SCAN_POLL_SECONDS
}

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayboxConfig {
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
}

impl RelayboxConfig {
    /// Load configuration from a JSON file, then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: &Path) -> RelayResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> RelayResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> RelayResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override recognized keys from `RELAYBOX_*` environment variables.
    fn load_from_env(&mut self) {
        if let Some(v) = env_parse("RELAYBOX_DISPATCH_BATCH_SIZE") {
            self.dispatcher.batch_size = v;
        }
        if let Some(v) = env_parse("RELAYBOX_DISPATCH_MAX_RETRY") {
            self.dispatcher.max_retry = v;
        }
        if let Some(v) = env_parse("RELAYBOX_DISPATCH_POLL_SECONDS") {
            self.dispatcher.poll_interval_seconds = v;
        }
        if let Some(v) = env_parse("RELAYBOX_SCAN_BATCH_SIZE") {
            self.scanner.batch_size = v;
        }
        if let Some(v) = env_parse("RELAYBOX_SCAN_POLL_SECONDS") {
            self.scanner.poll_interval_seconds = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
