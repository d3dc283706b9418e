//! Engine configuration.
//!
//! All fields default to sensible values so `EngineConfig::default()` is a
//! working configuration; a TOML file can override any subset.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::video::Priority;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Hard ceiling for cached segment bytes.
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,

    /// Directory for assembled playable artifacts. Session-transient;
    /// cleared on shutdown.
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,

    #[serde(default)]
    pub download: DownloadConfig,

    #[serde(default)]
    pub manifest: ManifestConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: default_max_cache_bytes(),
            spool_dir: default_spool_dir(),
            download: DownloadConfig::default(),
            manifest: ManifestConfig::default(),
        }
    }
}

/// Download worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    /// Concurrency ceiling of the worker pool.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Retry budget per segment before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fetch timeout for urgent (current item, segment 0) downloads.
    #[serde(default = "default_urgent_timeout")]
    pub urgent_timeout_secs: u64,

    /// Fetch timeout for high-priority downloads.
    #[serde(default = "default_high_timeout")]
    pub high_timeout_secs: u64,

    /// Fetch timeout for background downloads.
    #[serde(default = "default_normal_timeout")]
    pub normal_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            urgent_timeout_secs: default_urgent_timeout(),
            high_timeout_secs: default_high_timeout(),
            normal_timeout_secs: default_normal_timeout(),
        }
    }
}

impl DownloadConfig {
    /// Priority-dependent fetch timeout: urgent work fails fast so it can
    /// be retried, background work is given more slack.
    pub fn fetch_timeout(&self, priority: Priority) -> Duration {
        let secs = match priority {
            Priority::Urgent => self.urgent_timeout_secs,
            Priority::High => self.high_timeout_secs,
            Priority::Normal => self.normal_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// Manifest probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ManifestConfig {
    /// Suffix appended to a source location to derive its manifest URL.
    #[serde(default = "default_probe_suffix")]
    pub probe_suffix: String,

    /// Timeout for the manifest probe request.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for ManifestConfig {
    fn default() -> Self {
        Self {
            probe_suffix: default_probe_suffix(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_max_cache_bytes() -> u64 {
    // 256 MiB: a few dozen short-form videos.
    256 * 1024 * 1024
}

fn default_spool_dir() -> PathBuf {
    std::env::temp_dir().join("reelcache")
}

fn default_concurrency() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_urgent_timeout() -> u64 {
    5
}

fn default_high_timeout() -> u64 {
    10
}

fn default_normal_timeout() -> u64 {
    15
}

fn default_probe_suffix() -> String {
    ".manifest.json".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

/// Load configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: EngineConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    validate_config(&config)?;

    Ok(config)
}

/// Validate configuration.
pub fn validate_config(config: &EngineConfig) -> Result<()> {
    if config.max_cache_bytes == 0 {
        anyhow::bail!("max_cache_bytes cannot be 0");
    }

    if config.download.concurrency == 0 {
        anyhow::bail!("download.concurrency cannot be 0");
    }

    if config.manifest.probe_suffix.is_empty() {
        anyhow::bail!("manifest.probe_suffix cannot be empty");
    }

    Ok(())
}
