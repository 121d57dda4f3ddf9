//! Relay and endpoint configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::helpers::{env_millis, env_secs, env_usize};
use crate::{Error, Result};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_CHUNK_SIZE: usize = 16 * 1024;
pub const DEFAULT_MAX_DESCRIPTION_BYTES: usize = 32 * 1024;
pub const DEFAULT_NEGOTIATION_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_NEGOTIATIONS: usize = 1;
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STATE_DIR: &str = ".ferry";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// The relay is reclaimed after this long without any event.
    pub idle_timeout: Duration,
    /// Heartbeat period on the streaming side, on top of per-chunk pings.
    pub keepalive_interval: Duration,
    /// Chunk size produced by stream sources.
    pub chunk_size: usize,
    /// Largest session description accepted by the relay.
    pub max_description_bytes: usize,
    /// Negotiations older than this are dropped by the cleanup pass.
    pub negotiation_ttl: Duration,
    pub max_negotiations: usize,
    /// How long an endpoint waits for ICE gathering to finish.
    pub gather_timeout: Duration,
    /// Where the allow-list and pending-operation marker live.
    pub state_dir: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_description_bytes: DEFAULT_MAX_DESCRIPTION_BYTES,
            negotiation_ttl: DEFAULT_NEGOTIATION_TTL,
            max_negotiations: DEFAULT_MAX_NEGOTIATIONS,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `FERRY_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            idle_timeout: env_secs("FERRY_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            keepalive_interval: env_millis(
                "FERRY_KEEPALIVE_INTERVAL_MS",
                defaults.keepalive_interval,
            ),
            chunk_size: env_usize("FERRY_CHUNK_SIZE", defaults.chunk_size),
            max_description_bytes: env_usize(
                "FERRY_MAX_DESCRIPTION_BYTES",
                defaults.max_description_bytes,
            ),
            negotiation_ttl: env_secs("FERRY_NEGOTIATION_TTL_SECS", defaults.negotiation_ttl),
            max_negotiations: env_usize("FERRY_MAX_NEGOTIATIONS", defaults.max_negotiations),
            gather_timeout: env_millis("FERRY_GATHER_TIMEOUT_MS", defaults.gather_timeout),
            state_dir: std::env::var("FERRY_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be non-zero"));
        }
        if self.max_description_bytes == 0 {
            return Err(Error::config("max_description_bytes must be non-zero"));
        }
        if self.max_negotiations == 0 {
            return Err(Error::config("max_negotiations must be non-zero"));
        }
        if self.idle_timeout.is_zero() {
            return Err(Error::config("idle_timeout must be non-zero"));
        }
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.idle_timeout {
            return Err(Error::config(format!(
                "keepalive_interval ({:?}) must be non-zero and shorter than idle_timeout ({:?})",
                self.keepalive_interval, self.idle_timeout
            )));
        }
        Ok(())
    }
}
