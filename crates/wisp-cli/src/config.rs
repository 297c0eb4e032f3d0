//! Configuration system for the WISP CLI.
//!
//! The TOML file mirrors [`NodeConfig`] with durations spelled out in
//! milliseconds or seconds. Every field has a default, so a partial file is
//! valid.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use wisp_core::{NodeConfig, ReceiverConfig, StoreConfig, TransferConfig};

/// WISP configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Sender engine configuration
    #[serde(default)]
    pub transfer: TransferSection,
    /// Receiver configuration
    #[serde(default)]
    pub receiver: ReceiverSection,
    /// Chunk store configuration
    #[serde(default)]
    pub store: StoreSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sender engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Window size a transfer starts with
    pub initial_pipeline: usize,
    /// Smallest window
    pub min_pipeline: usize,
    /// Largest window
    pub max_pipeline: usize,
    /// Smoothed RTT a transfer starts with
    pub initial_rtt_ms: u64,
    /// Weight of the newest RTT sample
    pub rtt_alpha: f64,
    /// Window grows below this RTT
    pub good_rtt_ms: u64,
    /// Window halves above this RTT
    pub bad_rtt_ms: u64,
    /// Wait for a chunk's first ack
    pub ack_timeout_ms: u64,
    /// Attempts per chunk
    pub max_attempts: u32,
    /// Smoothed RTT forced by an ack timeout
    pub timeout_penalty_rtt_ms: u64,
    /// Chunks per catch-up burst
    pub replay_batch_size: usize,
    /// Pause between catch-up bursts
    pub replay_pause_ms: u64,
    /// How long completed transfers stay available
    pub retention_secs: u64,
    /// Progress sampling period
    pub progress_interval_ms: u64,
}

/// Receiver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverSection {
    /// How long completion waits for storage
    pub barrier_timeout_secs: u64,
    /// Missing chunks tolerated at barrier timeout
    pub missing_tolerance: u64,
    /// Storage retries per chunk
    pub max_store_requeues: u32,
    /// Delay before a storage retry
    pub requeue_backoff_ms: u64,
}

/// Chunk store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Chunks per batch
    pub batch_size: usize,
    /// Worker count; CPU count when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

impl Default for TransferSection {
    fn default() -> Self {
        let c = TransferConfig::default();
        Self {
            initial_pipeline: c.initial_pipeline,
            min_pipeline: c.min_pipeline,
            max_pipeline: c.max_pipeline,
            initial_rtt_ms: millis(c.initial_rtt),
            rtt_alpha: c.rtt_alpha,
            good_rtt_ms: millis(c.good_rtt),
            bad_rtt_ms: millis(c.bad_rtt),
            ack_timeout_ms: millis(c.ack_timeout),
            max_attempts: c.max_attempts,
            timeout_penalty_rtt_ms: millis(c.timeout_penalty_rtt),
            replay_batch_size: c.replay_batch_size,
            replay_pause_ms: millis(c.replay_pause),
            retention_secs: c.retention.as_secs(),
            progress_interval_ms: millis(c.progress_interval),
        }
    }
}

impl Default for ReceiverSection {
    fn default() -> Self {
        let c = ReceiverConfig::default();
        Self {
            barrier_timeout_secs: c.barrier_timeout.as_secs(),
            missing_tolerance: c.missing_tolerance,
            max_store_requeues: c.max_store_requeues,
            requeue_backoff_ms: millis(c.requeue_backoff),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            batch_size: StoreConfig::default().batch_size,
            workers: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = self.to_toml()?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("wisp/config.toml")
    }

    /// Load config from the default path, or the defaults if there is none
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Engine configuration described by this file
    #[must_use]
    pub fn node_config(&self) -> NodeConfig {
        let t = &self.transfer;
        let r = &self.receiver;
        NodeConfig {
            transfer: TransferConfig {
                initial_pipeline: t.initial_pipeline,
                min_pipeline: t.min_pipeline,
                max_pipeline: t.max_pipeline,
                initial_rtt: Duration::from_millis(t.initial_rtt_ms),
                rtt_alpha: t.rtt_alpha,
                good_rtt: Duration::from_millis(t.good_rtt_ms),
                bad_rtt: Duration::from_millis(t.bad_rtt_ms),
                ack_timeout: Duration::from_millis(t.ack_timeout_ms),
                max_attempts: t.max_attempts,
                timeout_penalty_rtt: Duration::from_millis(t.timeout_penalty_rtt_ms),
                replay_batch_size: t.replay_batch_size,
                replay_pause: Duration::from_millis(t.replay_pause_ms),
                retention: Duration::from_secs(t.retention_secs),
                progress_interval: Duration::from_millis(t.progress_interval_ms),
            },
            receiver: ReceiverConfig {
                barrier_timeout: Duration::from_secs(r.barrier_timeout_secs),
                missing_tolerance: r.missing_tolerance,
                max_store_requeues: r.max_store_requeues,
                requeue_backoff: Duration::from_millis(r.requeue_backoff_ms),
            },
            store: StoreConfig {
                batch_size: self.store.batch_size,
                workers: self
                    .store
                    .workers
                    .unwrap_or_else(|| StoreConfig::default().workers),
            },
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        self.node_config().validate()?;
        Ok(())
    }
}
