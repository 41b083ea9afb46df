use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context};
use finsight_core::constants::{DEFAULT_PORTFOLIO_CACHE_TTL_SECS, DEFAULT_REFRESH_THRESHOLD_SECS};
use finsight_core::portfolio::TimeoutPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub cache_ttl: Duration,
    pub token_refresh_interval: Duration,
    pub token_refresh_threshold: Duration,
    /// `None` when `FS_REQUEST_TIMEOUT_MS` is 0.
    pub request_timeout: Option<Duration>,
    pub timeout_policy: TimeoutPolicy,
    pub cache_sweep_interval: Duration,
    /// Refresh the portfolios of users with live sessions after each token sweep.
    pub portfolio_warmup: bool,
    pub log_format: LogFormat,
}

/// Upper bound for every duration setting (ten years).
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let db_path = lookup("FS_DB_PATH").unwrap_or_else(|| "./db/finsight.db".into());
        let cache_ttl = secs(&lookup, "FS_CACHE_TTL_SECS", DEFAULT_PORTFOLIO_CACHE_TTL_SECS)?;
        let token_refresh_interval = positive_secs(&lookup, "FS_TOKEN_REFRESH_INTERVAL_SECS", 3600)?;
        let token_refresh_threshold = secs(
            &lookup,
            "FS_TOKEN_REFRESH_THRESHOLD_SECS",
            DEFAULT_REFRESH_THRESHOLD_SECS,
        )?;
        let timeout_ms: u64 = parse_var(&lookup, "FS_REQUEST_TIMEOUT_MS", 30000)?;
        if timeout_ms > MAX_DURATION_SECS * 1000 {
            return Err(anyhow!(
                "Invalid FS_REQUEST_TIMEOUT_MS: must be at most {}",
                MAX_DURATION_SECS * 1000
            ));
        }
        let timeout_policy: TimeoutPolicy = match lookup("FS_TIMEOUT_POLICY") {
            Some(raw) => raw
                .parse()
                .map_err(|e| anyhow!("Invalid FS_TIMEOUT_POLICY: {}", e))?,
            None => TimeoutPolicy::Fail,
        };
        let cache_sweep_interval = positive_secs(&lookup, "FS_CACHE_SWEEP_INTERVAL_SECS", 3600)?;
        let portfolio_warmup: bool = parse_var(&lookup, "FS_PORTFOLIO_WARMUP", true)?;
        let log_format: LogFormat = match lookup("FS_LOG_FORMAT") {
            Some(raw) => raw.parse().context("Invalid FS_LOG_FORMAT")?,
            None => LogFormat::Text,
        };

        Ok(Self {
            db_path,
            cache_ttl,
            token_refresh_interval,
            token_refresh_threshold,
            request_timeout: (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms)),
            timeout_policy,
            cache_sweep_interval,
            portfolio_warmup,
            log_format,
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} '{}': {}", key, raw, e)),
        None => Ok(default),
    }
}

fn secs<F>(lookup: &F, key: &str, default: u64) -> anyhow::Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value: u64 = parse_var(lookup, key, default)?;
    if value > MAX_DURATION_SECS {
        return Err(anyhow!(
            "Invalid {}: must be at most {} seconds",
            key,
            MAX_DURATION_SECS
        ));
    }
    Ok(Duration::from_secs(value))
}

/// Interval values; tokio intervals reject a zero period.
fn positive_secs<F>(lookup: &F, key: &str, default: u64) -> anyhow::Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let value = secs(lookup, key, default)?;
    if value.is_zero() {
        return Err(anyhow!("Invalid {}: must be greater than zero", key));
    }
    Ok(value)
}
