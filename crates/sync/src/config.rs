//! Engine configuration: defaults plus environment overrides.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::retry::RetryPolicy;

/// Runtime configuration of the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the back-office API (without the `/api` suffix).
    pub api_url: String,
    /// Bearer token sent with every remote call.
    pub auth_token: Option<String>,
    pub retry: RetryPolicy,
    /// Upper bound on a single remote call.
    pub request_timeout: Duration,
    /// Poll period of the background worker.
    pub poll_interval: Duration,
    /// Partitions started per drain cycle.
    pub max_partitions_per_cycle: usize,
    /// SQLite file for the durable stores (`None` = platform default).
    pub db_path: Option<PathBuf>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            auth_token: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(30),
            max_partitions_per_cycle: 64,
            db_path: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from `STOCKMAN_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = var("STOCKMAN_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        config.auth_token = var("STOCKMAN_AUTH_TOKEN");

        if let Some(raw) = var("STOCKMAN_SYNC_MAX_ATTEMPTS") {
            config.retry.max_attempts = raw
                .trim()
                .parse()
                .with_context(|| format!("STOCKMAN_SYNC_MAX_ATTEMPTS must be an integer, got {raw:?}"))?;
            anyhow::ensure!(config.retry.max_attempts > 0, "STOCKMAN_SYNC_MAX_ATTEMPTS must be at least 1");
        }
        if let Some(raw) = var("STOCKMAN_SYNC_BASE_DELAY_MS") {
            config.retry.base_delay = Duration::from_millis(parse_u64("STOCKMAN_SYNC_BASE_DELAY_MS", &raw)?);
        }
        if let Some(raw) = var("STOCKMAN_SYNC_MAX_DELAY_SECS") {
            config.retry.max_delay = Duration::from_secs(parse_u64("STOCKMAN_SYNC_MAX_DELAY_SECS", &raw)?);
        }
        if let Some(raw) = var("STOCKMAN_SYNC_POLL_SECS") {
            let secs = parse_u64("STOCKMAN_SYNC_POLL_SECS", &raw)?;
            anyhow::ensure!(secs > 0, "STOCKMAN_SYNC_POLL_SECS must be at least 1");
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Some(raw) = var("STOCKMAN_SYNC_TIMEOUT_SECS") {
            let secs = parse_u64("STOCKMAN_SYNC_TIMEOUT_SECS", &raw)?;
            anyhow::ensure!(secs > 0, "STOCKMAN_SYNC_TIMEOUT_SECS must be at least 1");
            config.request_timeout = Duration::from_secs(secs);
        }
        config.db_path = var("STOCKMAN_SYNC_DB_PATH").map(PathBuf::from);

        Ok(config)
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

fn parse_u64(key: &str, raw: &str) -> anyhow::Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("{key} must be a non-negative integer, got {raw:?}"))
}
