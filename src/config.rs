//! Queue configuration
//!
//! This module contains all configuration options for the download queue.

use crate::error::{PumpError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the download queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Directory that default and relative output paths resolve against
    pub download_dir: PathBuf,

    /// Persisted queue file, None = platform data dir
    pub state_file: Option<PathBuf>,

    /// Maximum pumpings transferring at once (worker pool size)
    pub max_workers: usize,

    /// Maximum parallel sections per pumping
    pub max_sections: usize,

    /// Minimum section size in bytes (won't split smaller than this)
    pub min_section_size: u64,

    /// How often a downloading worker publishes progress
    pub progress_interval_ms: u64,

    /// How often a downloading worker checkpoints to storage
    pub checkpoint_interval_ms: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,

    /// HTTP configuration
    pub http: HttpConfig,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Connection attempts per run before a pumping fails
    pub attempt_count: u32,

    /// Initial backoff in milliseconds
    pub retry_delay_ms: u64,

    /// Maximum backoff in milliseconds
    pub max_retry_delay_ms: u64,

    /// Jitter applied to the backoff, as a fraction in [0, 1]
    pub retry_jitter: f64,

    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,

    /// Proxy URL (e.g., "http://proxy:8080" or "socks5://proxy:1080")
    pub proxy_url: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            state_file: None,
            max_workers: 4,
            max_sections: 4,
            min_section_size: 1024 * 1024, // 1 MiB
            progress_interval_ms: 250,
            checkpoint_interval_ms: 5000,
            user_agent: format!("pump-dl/{}", env!("CARGO_PKG_VERSION")),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            attempt_count: 3,
            retry_delay_ms: 1000,
            max_retry_delay_ms: 30000,
            retry_jitter: 0.25,
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            accept_invalid_certs: false,
            proxy_url: None,
        }
    }
}

impl QueueConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a JSON config file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PumpError::io(path, "Failed to read config", e))?;
        serde_json::from_str(&raw)
            .map_err(|e| PumpError::invalid_input("config", format!("{}: {}", path.display(), e)))
    }

    /// Set the download directory
    pub fn download_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_dir = path.into();
        self
    }

    /// Set the persisted queue file
    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    /// Set the worker pool size
    pub fn max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set maximum sections per pumping
    pub fn max_sections(mut self, max: usize) -> Self {
        self.max_sections = max;
        self
    }

    /// Set the minimum section size
    pub fn min_section_size(mut self, size: u64) -> Self {
        self.min_section_size = size;
        self
    }

    /// Set the progress publication interval
    pub fn progress_interval_ms(mut self, ms: u64) -> Self {
        self.progress_interval_ms = ms;
        self
    }

    /// Set the checkpoint interval
    pub fn checkpoint_interval_ms(mut self, ms: u64) -> Self {
        self.checkpoint_interval_ms = ms;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = ua.into();
        self
    }

    /// Set the connection attempt budget
    pub fn attempt_count(mut self, count: u32) -> Self {
        self.http.attempt_count = count;
        self
    }

    /// Set the backoff bounds
    pub fn retry_delay(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.http.retry_delay_ms = initial_ms;
        self.http.max_retry_delay_ms = max_ms;
        self
    }

    /// Set the backoff jitter factor
    pub fn retry_jitter(mut self, jitter: f64) -> Self {
        self.http.retry_jitter = jitter;
        self
    }

    /// Set the redirect bound
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.http.max_redirects = max;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.download_dir.exists() {
            return Err(PumpError::invalid_input(
                "download_dir",
                format!("Directory does not exist: {:?}", self.download_dir),
            ));
        }

        if !self.download_dir.is_dir() {
            return Err(PumpError::invalid_input(
                "download_dir",
                format!("Path is not a directory: {:?}", self.download_dir),
            ));
        }

        if self.max_workers == 0 {
            return Err(PumpError::invalid_input("max_workers", "Must be at least 1"));
        }

        if self.max_sections == 0 {
            return Err(PumpError::invalid_input("max_sections", "Must be at least 1"));
        }

        if self.min_section_size == 0 {
            return Err(PumpError::invalid_input(
                "min_section_size",
                "Must be at least 1 byte",
            ));
        }

        if self.progress_interval_ms == 0 || self.checkpoint_interval_ms == 0 {
            return Err(PumpError::invalid_input(
                "progress_interval_ms",
                "Intervals must be non-zero",
            ));
        }

        if self.http.attempt_count == 0 {
            return Err(PumpError::invalid_input(
                "attempt_count",
                "Must be at least 1",
            ));
        }

        if !(0.0..=1.0).contains(&self.http.retry_jitter) {
            return Err(PumpError::invalid_input(
                "retry_jitter",
                "Must be between 0.0 and 1.0",
            ));
        }

        Ok(())
    }

    /// Get the state file path, using default if not set
    pub fn get_state_file(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pump-dl")
                .join("queue.json")
        })
    }

    pub(crate) fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub(crate) fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}
