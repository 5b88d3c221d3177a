//! Listener configuration.
//!
//! Tuning knobs have defaults; endpoints and the contract address are required. Values come from
//! environment variables ([ListenerConfig::from_env]) and may be overridden by CLI flags in the
//! binary. [ListenerConfig::validate] runs before the coordinator starts.

use crate::abi::{topic_from_signature, DEFAULT_EVENT_SIGNATURE};
use crate::error::ConfigurationError;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIRMATION_BLOCKS: u64 = 12;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_STATE_FILE: &str = "listener_state.json";
pub const DEFAULT_MAX_BLOCK_RANGE: u64 = 1000;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DEDUP_RETENTION_BLOCKS: u64 = 50_000;

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// HTTP RPC URL of the source chain (eth_blockNumber, eth_getLogs).
    pub rpc_url: String,
    /// Bridge contract address (20 bytes).
    pub contract_address: [u8; 20],
    /// topic0 of the bridged event.
    pub event_topic: [u8; 32],
    /// Relayer endpoint that receives one POST per event.
    pub relayer_endpoint: String,
    /// Cursor height when no state file exists; the first scanned block is the one after it.
    /// `None` starts at the current height.
    pub start_block: Option<u64>,
    /// Blocks that must be mined on top of a block before it is scanned.
    pub confirmation_depth: u64,
    pub poll_interval: Duration,
    /// Max block range per eth_getLogs request (one checkpointed batch).
    pub max_block_range: u64,
    /// Bound on every ledger and sink call.
    pub call_timeout: Duration,
    pub state_file: PathBuf,
    /// Processed transaction ids older than `cursor - dedup_retention_blocks` are evicted.
    pub dedup_retention_blocks: u64,
    pub retry: RetryConfig,
}

/// Bounded exponential backoff for transient ledger and sink failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random jitter added to each delay. Zero disables jitter.
    pub max_jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl ListenerConfig {
    /// Config with default tuning for the given endpoints.
    pub fn new(rpc_url: impl Into<String>, relayer_endpoint: impl Into<String>, contract_address: [u8; 20]) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            contract_address,
            event_topic: topic_from_signature(DEFAULT_EVENT_SIGNATURE),
            relayer_endpoint: relayer_endpoint.into(),
            start_block: None,
            confirmation_depth: DEFAULT_CONFIRMATION_BLOCKS,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_block_range: DEFAULT_MAX_BLOCK_RANGE,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            dedup_retention_blocks: DEFAULT_DEDUP_RETENTION_BLOCKS,
            retry: RetryConfig::default(),
        }
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (environment, or a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let rpc_url = get("SOURCE_CHAIN_RPC_URL").ok_or(ConfigurationError::Missing("SOURCE_CHAIN_RPC_URL"))?;
        let contract = get("BRIDGE_CONTRACT_ADDRESS").ok_or(ConfigurationError::Missing("BRIDGE_CONTRACT_ADDRESS"))?;
        let relayer = get("RELAYER_API_ENDPOINT").ok_or(ConfigurationError::Missing("RELAYER_API_ENDPOINT"))?;
        let mut config = Self::new(rpc_url, relayer, parse_address("BRIDGE_CONTRACT_ADDRESS", &contract)?);

        if let Some(topic) = get("TOKENS_LOCKED_EVENT_HASH") {
            config.event_topic = parse_topic("TOKENS_LOCKED_EVENT_HASH", &topic)?;
        } else if let Some(sig) = get("EVENT_SIGNATURE") {
            config.event_topic = topic_from_signature(sig.trim());
        }
        if let Some(v) = get("START_BLOCK") {
            config.start_block = Some(parse_u64("START_BLOCK", &v)?);
        }
        if let Some(v) = get("CONFIRMATION_BLOCKS") {
            config.confirmation_depth = parse_u64("CONFIRMATION_BLOCKS", &v)?;
        }
        if let Some(v) = get("POLL_INTERVAL_SECONDS") {
            config.poll_interval = Duration::from_secs(parse_u64("POLL_INTERVAL_SECONDS", &v)?);
        }
        if let Some(v) = get("STATE_FILE") {
            config.state_file = PathBuf::from(v);
        }
        if let Some(v) = get("MAX_BLOCK_RANGE") {
            config.max_block_range = parse_u64("MAX_BLOCK_RANGE", &v)?;
        }
        if let Some(v) = get("CALL_TIMEOUT_SECONDS") {
            config.call_timeout = Duration::from_secs(parse_u64("CALL_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = get("DEDUP_RETENTION_BLOCKS") {
            config.dedup_retention_blocks = parse_u64("DEDUP_RETENTION_BLOCKS", &v)?;
        }
        if let Some(v) = get("MAX_DELIVERY_ATTEMPTS") {
            let n = parse_u64("MAX_DELIVERY_ATTEMPTS", &v)?;
            config.retry.max_attempts = u32::try_from(n).map_err(|_| ConfigurationError::Invalid {
                key: "MAX_DELIVERY_ATTEMPTS",
                reason: format!("{} is too large", n),
            })?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the coordinator cannot run with.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.rpc_url.trim().is_empty() {
            return Err(ConfigurationError::Missing("SOURCE_CHAIN_RPC_URL"));
        }
        if self.relayer_endpoint.trim().is_empty() {
            return Err(ConfigurationError::Missing("RELAYER_API_ENDPOINT"));
        }
        if self.max_block_range == 0 {
            return Err(ConfigurationError::Invalid {
                key: "MAX_BLOCK_RANGE",
                reason: "must be greater than 0".into(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigurationError::Invalid {
                key: "MAX_DELIVERY_ATTEMPTS",
                reason: "must be greater than 0".into(),
            });
        }
        if self.call_timeout.is_zero() {
            return Err(ConfigurationError::Invalid {
                key: "CALL_TIMEOUT_SECONDS",
                reason: "must be greater than 0".into(),
            });
        }
        if self.dedup_retention_blocks < self.confirmation_depth {
            return Err(ConfigurationError::Invalid {
                key: "DEDUP_RETENTION_BLOCKS",
                reason: format!(
                    "{} is below the confirmation depth {}",
                    self.dedup_retention_blocks, self.confirmation_depth
                ),
            });
        }
        Ok(())
    }
}

pub fn parse_address(key: &'static str, s: &str) -> Result<[u8; 20], ConfigurationError> {
    let bytes = parse_hex(key, s)?;
    bytes.try_into().map_err(|b: Vec<u8>| ConfigurationError::Invalid {
        key,
        reason: format!("expected 20 bytes, got {}", b.len()),
    })
}

pub fn parse_topic(key: &'static str, s: &str) -> Result<[u8; 32], ConfigurationError> {
    let bytes = parse_hex(key, s)?;
    bytes.try_into().map_err(|b: Vec<u8>| ConfigurationError::Invalid {
        key,
        reason: format!("expected 32 bytes, got {}", b.len()),
    })
}

fn parse_hex(key: &'static str, s: &str) -> Result<Vec<u8>, ConfigurationError> {
    let s = s.trim();
    hex::decode(s.strip_prefix("0x").unwrap_or(s)).map_err(|e| ConfigurationError::Invalid {
        key,
        reason: e.to_string(),
    })
}

pub fn parse_u64(key: &'static str, s: &str) -> Result<u64, ConfigurationError> {
    s.trim().parse().map_err(|e: std::num::ParseIntError| ConfigurationError::Invalid {
        key,
        reason: e.to_string(),
    })
}
