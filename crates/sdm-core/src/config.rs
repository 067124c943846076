use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Hard cap on per-job worker count; requests above this are rejected.
pub const MAX_WORKERS: usize = 30;

/// Global configuration loaded from `~/.config/sdm/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdmConfig {
    /// Maximum number of jobs transferring at once (queue admission cap).
    pub max_concurrent_jobs: usize,
    /// Default worker count for jobs that don't request one.
    pub default_workers: usize,
    /// Minimum milliseconds between progress events per job (status changes
    /// always emit).
    pub progress_interval_ms: u64,
    /// Minimum seconds between sidecar writes per job (a final write is
    /// forced before any terminal transition).
    pub sidecar_interval_secs: u64,
    /// Width of the sliding speed-sample window, in seconds.
    pub speed_window_secs: u64,
    /// Terminal jobs older than this are eligible for cleanup.
    pub cleanup_age_hours: u64,
    /// Keep at most this many terminal jobs; oldest are dropped first.
    pub max_completed: usize,
    /// Host suffixes accepted by URL validation. Empty means any host.
    pub allowed_host_suffixes: Vec<String>,
    /// Accept plain-http URLs. Off by default; tests use it for the
    /// loopback server.
    pub allow_insecure: bool,
    /// Adaptive worker-count tuning.
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
    /// Worker retry/backoff tuning.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff settings for transient transfer errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt before a worker gives up.
    pub max_retries: u32,
    /// First backoff delay.
    pub base_delay_ms: u64,
    /// Backoff ceiling (also caps server `Retry-After` hints).
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay_ms: 100,
            max_delay_ms: 3200,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

/// Tuning for the per-job adaptive controller.
///
/// The thresholds are empirical; they ship as configuration so deployments
/// can revisit them without a rebuild.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Seconds between controller ticks.
    pub tick_secs: u64,
    /// A worker below this fraction of the median throughput is a straggler.
    pub straggler_ratio: f64,
    /// Consecutive slow ticks before a straggler is removed.
    pub straggler_ticks: u32,
    /// Add a worker when median per-worker throughput exceeds this fraction
    /// of the server's per-connection rate hint.
    pub hint_headroom: f64,
    /// Relative change under which two ticks count as a plateau.
    pub plateau_tolerance: f64,
    /// Never split a segment whose remainder is below this many bytes.
    pub min_split_bytes: u64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            tick_secs: 5,
            straggler_ratio: 0.25,
            straggler_ticks: 2,
            hint_headroom: 0.9,
            plateau_tolerance: 0.05,
            min_split_bytes: 1024 * 1024,
        }
    }
}

impl Default for SdmConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 3,
            default_workers: 4,
            progress_interval_ms: 500,
            sidecar_interval_secs: 2,
            speed_window_secs: 3,
            cleanup_age_hours: 24,
            max_completed: 100,
            allowed_host_suffixes: Vec::new(),
            allow_insecure: false,
            adaptive: AdaptiveConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SdmConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn sidecar_interval(&self) -> Duration {
        Duration::from_secs(self.sidecar_interval_secs)
    }

    pub fn speed_window(&self) -> Duration {
        Duration::from_secs(self.speed_window_secs)
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("sdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<SdmConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = SdmConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: SdmConfig = toml::from_str(&data)?;
    Ok(cfg)
}
