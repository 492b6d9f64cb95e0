// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job configuration, loaded from JSON or from environment variables.

use serde::{Deserialize, Serialize};
use superstep_protocol::{MeshServerConfig, PeerClientConfig};

use crate::store::StoreKind;

/// Per-job settings shared by every worker.
///
/// Field names follow the camelCase keys used by the surrounding job
/// framework (`ioThreads`, `connectRetryAttempts`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    /// Threads of the dedicated network runtime
    pub io_threads: usize,
    /// Threads of the vertex compute pool
    pub compute_threads: usize,
    /// Connection attempts per peer before the worker gives up
    pub connect_retry_attempts: u32,
    /// Fixed delay between connection attempts
    pub connect_retry_backoff_ms: u64,
    /// Timeout of a single connection attempt
    pub connect_timeout_ms: u64,
    /// Bind attempts for the listening socket
    pub port_bind_retry_attempts: u32,
    /// Fixed delay between bind attempts
    pub port_bind_retry_backoff_ms: u64,
    /// Messages buffered per destination before an early flush
    pub batch_flush_threshold: usize,
    /// Encoded frames queued per peer link before senders wait for the network
    pub outbound_queue_frames: usize,
    /// Message store variant
    pub message_store: StoreKind,
    /// Upper bound on supersteps run by the driver (0 for unbounded)
    pub max_rounds: u64,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            io_threads: 2,
            compute_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            connect_retry_attempts: 10,
            connect_retry_backoff_ms: 2_000,
            connect_timeout_ms: 5_000,
            port_bind_retry_attempts: 10,
            port_bind_retry_backoff_ms: 500,
            batch_flush_threshold: 4_096,
            outbound_queue_frames: 64,
            message_store: StoreKind::Dense,
            max_rounds: 0,
        }
    }
}

impl JobConfig {
    /// Parse a JSON document; missing keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `SUPERSTEP_IO_THREADS`: network runtime threads (default: 2)
    /// - `SUPERSTEP_COMPUTE_THREADS`: compute pool threads (default: available cores)
    /// - `SUPERSTEP_CONNECT_RETRY_ATTEMPTS`: attempts per peer (default: 10)
    /// - `SUPERSTEP_CONNECT_RETRY_BACKOFF_MS`: delay between attempts (default: 2000)
    /// - `SUPERSTEP_CONNECT_TIMEOUT_MS`: single attempt timeout (default: 5000)
    /// - `SUPERSTEP_PORT_BIND_RETRY_ATTEMPTS`: bind attempts (default: 10)
    /// - `SUPERSTEP_PORT_BIND_RETRY_BACKOFF_MS`: delay between bind attempts (default: 500)
    /// - `SUPERSTEP_BATCH_FLUSH_THRESHOLD`: messages per early flush (default: 4096)
    /// - `SUPERSTEP_OUTBOUND_QUEUE_FRAMES`: frames queued per peer link (default: 64)
    /// - `SUPERSTEP_MESSAGE_STORE`: `dense` or `sparse` (default: dense)
    /// - `SUPERSTEP_MAX_ROUNDS`: driver round limit, 0 for none (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let default = Self::default();

        let config = Self {
            io_threads: env_or("SUPERSTEP_IO_THREADS", default.io_threads, "must be a positive integer")?,
            compute_threads: env_or(
                "SUPERSTEP_COMPUTE_THREADS",
                default.compute_threads,
                "must be a positive integer",
            )?,
            connect_retry_attempts: env_or(
                "SUPERSTEP_CONNECT_RETRY_ATTEMPTS",
                default.connect_retry_attempts,
                "must be a positive integer",
            )?,
            connect_retry_backoff_ms: env_or(
                "SUPERSTEP_CONNECT_RETRY_BACKOFF_MS",
                default.connect_retry_backoff_ms,
                "must be a number of milliseconds",
            )?,
            connect_timeout_ms: env_or(
                "SUPERSTEP_CONNECT_TIMEOUT_MS",
                default.connect_timeout_ms,
                "must be a number of milliseconds",
            )?,
            port_bind_retry_attempts: env_or(
                "SUPERSTEP_PORT_BIND_RETRY_ATTEMPTS",
                default.port_bind_retry_attempts,
                "must be a positive integer",
            )?,
            port_bind_retry_backoff_ms: env_or(
                "SUPERSTEP_PORT_BIND_RETRY_BACKOFF_MS",
                default.port_bind_retry_backoff_ms,
                "must be a number of milliseconds",
            )?,
            batch_flush_threshold: env_or(
                "SUPERSTEP_BATCH_FLUSH_THRESHOLD",
                default.batch_flush_threshold,
                "must be a positive integer",
            )?,
            outbound_queue_frames: env_or(
                "SUPERSTEP_OUTBOUND_QUEUE_FRAMES",
                default.outbound_queue_frames,
                "must be a positive integer",
            )?,
            message_store: env_or(
                "SUPERSTEP_MESSAGE_STORE",
                default.message_store,
                "must be 'dense' or 'sparse'",
            )?,
            max_rounds: env_or(
                "SUPERSTEP_MAX_ROUNDS",
                default.max_rounds,
                "must be a non-negative integer",
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no worker can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.io_threads == 0 {
            return Err(ConfigError::Invalid("ioThreads", "must be at least 1"));
        }
        if self.compute_threads == 0 {
            return Err(ConfigError::Invalid("computeThreads", "must be at least 1"));
        }
        if self.connect_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "connectRetryAttempts",
                "must be at least 1",
            ));
        }
        if self.port_bind_retry_attempts == 0 {
            return Err(ConfigError::Invalid(
                "portBindRetryAttempts",
                "must be at least 1",
            ));
        }
        if self.batch_flush_threshold == 0 {
            return Err(ConfigError::Invalid(
                "batchFlushThreshold",
                "must be at least 1",
            ));
        }
        if self.outbound_queue_frames == 0 {
            return Err(ConfigError::Invalid(
                "outboundQueueFrames",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Client settings for dialing peers
    pub fn peer_client_config(&self) -> PeerClientConfig {
        PeerClientConfig {
            connect_timeout_ms: self.connect_timeout_ms,
            connect_retry_attempts: self.connect_retry_attempts,
            connect_retry_backoff_ms: self.connect_retry_backoff_ms,
            outbound_queue_frames: self.outbound_queue_frames,
            ..Default::default()
        }
    }

    /// Server settings for the listening socket at `bind_addr`
    pub fn mesh_server_config(&self, bind_addr: std::net::SocketAddr) -> MeshServerConfig {
        MeshServerConfig {
            bind_addr,
            port_bind_retry_attempts: self.port_bind_retry_attempts,
            port_bind_retry_backoff_ms: self.port_bind_retry_backoff_ms,
            ..Default::default()
        }
    }
}

fn env_or<T: std::str::FromStr>(
    key: &'static str,
    default: T,
    hint: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(key, hint)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),

    /// The configuration document could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
