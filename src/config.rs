use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::pipeline::RetryPolicy;

/// Batch controller settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Records per batch
    pub batch_size: usize,
    /// Maximum records pulled from the source per run
    pub scan_limit: usize,
    /// Records processed concurrently within a batch
    pub concurrency: usize,
    /// Upper bound on any single store call
    pub store_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            scan_limit: 10_000,
            concurrency: 8,
            store_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by `BATCH_SIZE`, `SCAN_LIMIT`, `PIPELINE_CONCURRENCY`,
    /// `STORE_TIMEOUT_MS`, `RETRY_ATTEMPTS`, `RETRY_DELAY_MS` and
    /// `RETRY_MAX_DELAY_MS` where set
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let batch_size = parse_var(&lookup, "BATCH_SIZE")?.unwrap_or(defaults.batch_size);
        let scan_limit = parse_var(&lookup, "SCAN_LIMIT")?.unwrap_or(defaults.scan_limit);
        let concurrency =
            parse_var(&lookup, "PIPELINE_CONCURRENCY")?.unwrap_or(defaults.concurrency);
        let store_timeout = parse_var(&lookup, "STORE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.store_timeout);

        let retry = RetryPolicy {
            max_attempts: parse_var(&lookup, "RETRY_ATTEMPTS")?
                .unwrap_or(defaults.retry.max_attempts),
            base_delay: parse_var(&lookup, "RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: parse_var(&lookup, "RETRY_MAX_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.max_delay),
        };

        let config = Self {
            batch_size,
            scan_limit,
            concurrency,
            store_timeout,
            retry,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch_size > 0, "BATCH_SIZE must be at least 1");
        anyhow::ensure!(self.scan_limit > 0, "SCAN_LIMIT must be at least 1");
        anyhow::ensure!(self.concurrency > 0, "PIPELINE_CONCURRENCY must be at least 1");
        anyhow::ensure!(self.retry.max_attempts > 0, "RETRY_ATTEMPTS must be at least 1");
        anyhow::ensure!(!self.store_timeout.is_zero(), "STORE_TIMEOUT_MS must be positive");
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {}: {:?}", key, value)),
        None => Ok(None),
    }
}
