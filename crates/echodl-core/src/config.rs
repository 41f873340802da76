//! Engine configuration loaded from `~/.config/echodl/config.toml`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Retry policy parameters (optional `[retry]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per segment (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

impl RetryConfig {
    /// Build the runtime policy from the config values.
    pub fn to_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_secs_f64(self.base_delay_secs.max(0.0)),
            max_delay: Duration::from_secs(self.max_delay_secs),
        }
    }
}

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum jobs transferring at once.
    pub max_concurrent_jobs: usize,
    /// Maximum concurrent segment connections across all jobs.
    pub max_total_connections: usize,
    /// Maximum parallel segments per job.
    pub max_segments_per_job: usize,
    /// Minimum segment size in bytes; gaps are not split below this.
    pub min_segment_bytes: u64,
    /// Seconds between analytics ticks (progress events).
    pub progress_interval_secs: f64,
    /// Event channel capacity; lagging consumers skip oldest events.
    pub event_buffer: usize,
    /// Keep resume records of completed jobs instead of deleting them.
    /// Off by default so the jobs table stays bounded; turn on to get a
    /// download history in `echodl status` at the cost of rows that
    /// accumulate with every finished job.
    #[serde(default)]
    pub keep_resume_on_complete: bool,
    /// Optional retry policy; built-in defaults when missing.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    /// Connect timeout per network operation, in seconds.
    pub connect_timeout_secs: u64,
    /// Stall timeout: abort a transfer below 1 KiB/s for this long.
    pub stall_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            max_total_connections: 16,
            max_segments_per_job: 4,
            min_segment_bytes: 1024 * 1024,
            progress_interval_secs: 1.0,
            event_buffer: 256,
            keep_resume_on_complete: false,
            retry: None,
            connect_timeout_secs: 30,
            stall_timeout_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Runtime retry policy (configured or default).
    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        self.retry
            .as_ref()
            .map(RetryConfig::to_policy)
            .unwrap_or_default()
    }

    /// Network timeouts for fetch attempts.
    pub fn fetch_timeouts(&self) -> crate::fetch::FetchTimeouts {
        crate::fetch::FetchTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs.max(1)),
            stall: Duration::from_secs(self.stall_timeout_secs.max(1)),
        }
    }

    /// Analytics tick interval.
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs_f64(self.progress_interval_secs.max(0.05))
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("echodl")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig = toml::from_str(&data)?;
    Ok(cfg)
}
