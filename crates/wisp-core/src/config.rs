//! Node configuration

use crate::error::{Result, TransferError};
use std::time::Duration;
use wisp_files::StoreOptions;

/// Node configuration
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    /// Sender engine configuration
    pub transfer: TransferConfig,

    /// Receiver assembly configuration
    pub receiver: ReceiverConfig,

    /// Chunk store configuration
    pub store: StoreConfig,
}

impl NodeConfig {
    /// Check every section for values the engine cannot run with
    ///
    /// # Errors
    /// Returns `TransferError::InvalidConfig` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.transfer.validate()?;
        self.receiver.validate()?;
        self.store.validate()
    }
}

/// Sender engine configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Window size a new transfer starts with
    pub initial_pipeline: usize,

    /// Smallest window
    pub min_pipeline: usize,

    /// Largest window
    pub max_pipeline: usize,

    /// Smoothed RTT a new transfer starts with
    pub initial_rtt: Duration,

    /// Weight of the newest sample in the RTT average
    pub rtt_alpha: f64,

    /// Below this smoothed RTT the window grows by one per ack
    pub good_rtt: Duration,

    /// Above this smoothed RTT the window halves
    pub bad_rtt: Duration,

    /// How long to wait for the first ack of a chunk
    pub ack_timeout: Duration,

    /// Attempts per chunk before the transfer fails
    pub max_attempts: u32,

    /// Smoothed RTT forced after an ack timeout
    pub timeout_penalty_rtt: Duration,

    /// Chunks per burst when replaying to a late acceptor
    pub replay_batch_size: usize,

    /// Pause between replay bursts
    pub replay_pause: Duration,

    /// How long a completed transfer stays available for late acceptors
    pub retention: Duration,

    /// Progress and throughput sampling period
    pub progress_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            initial_pipeline: 32,
            min_pipeline: 4,
            max_pipeline: 256,
            initial_rtt: Duration::from_millis(100),
            rtt_alpha: 0.1,
            good_rtt: Duration::from_millis(150),
            bad_rtt: Duration::from_millis(800),
            ack_timeout: Duration::from_secs(5),
            max_attempts: 10,
            timeout_penalty_rtt: Duration::from_millis(9999),
            replay_batch_size: 8,
            replay_pause: Duration::from_millis(10),
            retention: Duration::from_secs(120), // 2 minutes
            progress_interval: Duration::from_millis(500),
        }
    }
}

impl TransferConfig {
    fn validate(&self) -> Result<()> {
        if self.min_pipeline == 0 {
            return Err(TransferError::invalid_config("min_pipeline must be at least 1"));
        }
        if self.min_pipeline > self.max_pipeline {
            return Err(TransferError::invalid_config(
                "min_pipeline must not exceed max_pipeline",
            ));
        }
        if !(self.min_pipeline..=self.max_pipeline).contains(&self.initial_pipeline) {
            return Err(TransferError::invalid_config(
                "initial_pipeline must lie within [min_pipeline, max_pipeline]",
            ));
        }
        if !(self.rtt_alpha > 0.0 && self.rtt_alpha <= 1.0) {
            return Err(TransferError::invalid_config("rtt_alpha must be in (0, 1]"));
        }
        if self.good_rtt >= self.bad_rtt {
            return Err(TransferError::invalid_config("good_rtt must be below bad_rtt"));
        }
        if self.ack_timeout.is_zero() {
            return Err(TransferError::invalid_config("ack_timeout must be non-zero"));
        }
        if self.max_attempts == 0 {
            return Err(TransferError::invalid_config("max_attempts must be at least 1"));
        }
        if self.replay_batch_size == 0 {
            return Err(TransferError::invalid_config(
                "replay_batch_size must be at least 1",
            ));
        }
        if self.progress_interval.is_zero() {
            return Err(TransferError::invalid_config(
                "progress_interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Receiver assembly configuration
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// How long `file-complete` waits for storage confirmation
    pub barrier_timeout: Duration,

    /// Unconfirmed chunks tolerated when the barrier times out
    pub missing_tolerance: u64,

    /// Times a chunk from a failed storage batch is enqueued again
    pub max_store_requeues: u32,

    /// Delay before re-enqueueing a failed batch
    pub requeue_backoff: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            barrier_timeout: Duration::from_secs(60),
            missing_tolerance: 5,
            max_store_requeues: 3,
            requeue_backoff: Duration::from_millis(100),
        }
    }
}

impl ReceiverConfig {
    fn validate(&self) -> Result<()> {
        if self.barrier_timeout.is_zero() {
            return Err(TransferError::invalid_config(
                "barrier_timeout must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Chunk store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Chunks per atomic batch
    pub batch_size: usize,

    /// Storage worker count (defaults to num_cpus)
    pub workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let options = StoreOptions::default();
        Self {
            batch_size: options.batch_size,
            workers: options.workers,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TransferError::invalid_config("batch_size must be at least 1"));
        }
        if self.workers == 0 {
            return Err(TransferError::invalid_config("workers must be at least 1"));
        }
        Ok(())
    }
}

impl From<&StoreConfig> for StoreOptions {
    fn from(config: &StoreConfig) -> Self {
        StoreOptions {
            batch_size: config.batch_size,
            workers: config.workers,
        }
    }
}
