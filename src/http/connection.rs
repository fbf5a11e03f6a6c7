//! Client construction and retry policy
//!
//! One `reqwest::Client` is shared by every worker of a queue. Redirects are
//! never followed by the client: the worker resolves them hop by hop so the
//! pumping's real URL can be tracked.

use crate::config::QueueConfig;
use crate::error::{PumpError, Result};
use reqwest::Client;
use std::time::Duration;

/// Build the HTTP client for a queue
pub fn build_client(config: &QueueConfig) -> Result<Client> {
    let http = &config.http;
    let mut builder = Client::builder()
        .user_agent(config.user_agent.clone())
        .connect_timeout(Duration::from_secs(http.connect_timeout))
        .read_timeout(Duration::from_secs(http.read_timeout))
        .redirect(reqwest::redirect::Policy::none())
        .danger_accept_invalid_certs(http.accept_invalid_certs)
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Duration::from_secs(90));

    if let Some(ref proxy_url) = http.proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|e| PumpError::invalid_input("proxy_url", e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| PumpError::Internal(format!("Failed to create HTTP client: {}", e)))
}

/// Retry policy with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per run before the pumping fails
    pub max_attempts: u32,
    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new(max_attempts: u32, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            initial_delay_ms,
            max_delay_ms,
            jitter_factor: 0.25,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.http.attempt_count,
            initial_delay_ms: config.http.retry_delay_ms,
            max_delay_ms: config.http.max_retry_delay_ms,
            jitter_factor: config.http.retry_jitter,
        }
    }

    /// Backoff after the `failures`-th failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(10);
        let base = self.initial_delay_ms.saturating_mul(2u64.pow(exponent));
        let capped = base.min(self.max_delay_ms);

        // Add jitter: +/- jitter_factor randomness
        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let with_jitter = (capped as f64 * (1.0 + jitter)).max(0.0) as u64;

        Duration::from_millis(with_jitter)
    }

    /// Whether the budget is spent after `failures` failed attempts
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
