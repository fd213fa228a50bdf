//! Gateway and sync configuration.
//!
//! Defaults suit a single-host deployment. `GatewayConfig::from_env` overlays
//! `CANVAS_SYNC_*` variables for the server binary.

use std::time::Duration;

use crate::error::ConfigError;

/// Operation log and session bookkeeping limits.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum operations retained per canvas log
    pub max_operations: usize,
    /// Operations older than this are evicted (None = length cap only)
    pub max_operation_age: Option<Duration>,
    /// Interval of the stale-session sweep
    pub cleanup_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_operations: 1000,
            max_operation_age: Some(Duration::from_secs(60 * 60)),
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Connection gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the server binary binds to
    pub bind_addr: String,
    /// Ping interval; a connection silent for a whole interval is closed
    pub heartbeat_interval: Duration,
    /// Fixed rate-limit window length
    pub rate_limit_window: Duration,
    /// Messages allowed per user per window
    pub rate_limit_max: u32,
    /// Prefix of canvas-scoped fanout channels
    pub channel_prefix: String,
    pub sync: SyncConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max: 100,
            channel_prefix: "canvas:".to_string(),
            sync: SyncConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overlaid with `CANVAS_SYNC_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("CANVAS_SYNC_BIND") {
            config.bind_addr = addr;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CANVAS_SYNC_HEARTBEAT_SECS")? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "CANVAS_SYNC_RATE_LIMIT_MAX")? {
            config.rate_limit_max = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CANVAS_SYNC_RATE_LIMIT_WINDOW_MS")? {
            config.rate_limit_window = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "CANVAS_SYNC_MAX_OPERATIONS")? {
            config.sync.max_operations = max;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CANVAS_SYNC_MAX_OPERATION_AGE_SECS")? {
            // 0 disables age-based eviction
            config.sync.max_operation_age = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CANVAS_SYNC_CLEANUP_SECS")? {
            config.sync.cleanup_interval = Duration::from_secs(secs);
        }

        if config.heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CANVAS_SYNC_HEARTBEAT_SECS",
                reason: "must be greater than zero".into(),
            });
        }
        if config.rate_limit_window.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CANVAS_SYNC_RATE_LIMIT_WINDOW_MS",
                reason: "must be greater than zero".into(),
            });
        }
        if config.sync.max_operations == 0 {
            return Err(ConfigError::Invalid {
                key: "CANVAS_SYNC_MAX_OPERATIONS",
                reason: "must be greater than zero".into(),
            });
        }
        if config.sync.cleanup_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "CANVAS_SYNC_CLEANUP_SECS",
                reason: "must be greater than zero".into(),
            });
        }

        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid { key, reason: e.to_string() }),
    }
}
