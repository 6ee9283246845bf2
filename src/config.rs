use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for ssltap.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Connection worker configuration.
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Event source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Rendered output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often to log event counters. Default: 60s.
    #[serde(default = "default_stats_report_interval", with = "humantime_serde")]
    pub stats_report_interval: Duration,
}

/// Connection worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Idle ticker period. Default: 1s.
    #[serde(default = "default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,

    /// Idle ticks tolerated before a worker retires. Default: 5.
    #[serde(default = "default_max_idle_ticks")]
    pub max_idle_ticks: u32,

    /// Per-worker inbound queue capacity. Default: 16.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Upper bound on waiting for workers to drain at shutdown. Default: 5s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Recorded capture to replay.
    #[serde(default)]
    pub replay_path: PathBuf,

    /// Capacity of the tracer -> processor event channel. Default: 1024.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Forget a connection's peer address after this long without traffic.
    /// Default: 5m.
    #[serde(default = "default_conn_idle_timeout", with = "humantime_serde")]
    pub conn_idle_timeout: Duration,
}

/// Rendered output configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutputConfig {
    /// Emit ANSI colors. Default: false.
    #[serde(default)]
    pub color: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address (e.g., ":9090"). Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_report_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_tick_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_idle_ticks() -> u32 {
    5
}

fn default_queue_capacity() -> usize {
    16
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_conn_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            processor: ProcessorConfig::default(),
            source: SourceConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
            stats_report_interval: default_stats_report_interval(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            max_idle_ticks: default_max_idle_ticks(),
            queue_capacity: default_queue_capacity(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            replay_path: PathBuf::new(),
            channel_capacity: default_channel_capacity(),
            conn_idle_timeout: default_conn_idle_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Self::read(path)?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Parse a YAML file without validating it, so callers can apply
    /// overrides first.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        self.processor.validate()?;

        if self.source.replay_path.as_os_str().is_empty() {
            bail!("source.replay_path is required");
        }

        if self.source.channel_capacity == 0 {
            bail!("source.channel_capacity must be positive");
        }

        if self.source.conn_idle_timeout.is_zero() {
            bail!("source.conn_idle_timeout must be positive");
        }

        if self.stats_report_interval.is_zero() {
            bail!("stats_report_interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled is true");
        }

        Ok(())
    }
}

impl ProcessorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tick_interval.is_zero() {
            bail!("processor.tick_interval must be positive");
        }

        if self.queue_capacity == 0 {
            bail!("processor.queue_capacity must be positive");
        }

        if self.shutdown_timeout.is_zero() {
            bail!("processor.shutdown_timeout must be positive");
        }

        Ok(())
    }
}
