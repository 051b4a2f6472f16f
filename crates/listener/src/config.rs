//! Listener configuration.

use crate::abi::TOKENS_LOCKED_TOPIC0;
use crate::guard::DEFAULT_REORG_MARGIN;
use alloy::primitives::{Address, B256};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Destination chain ids accepted when none are configured.
pub const DEFAULT_DESTINATION_CHAINS: &[u64] = &[1, 10, 56, 137, 8453, 42161];

/// What to do with a chunk once one of its events is dead-lettered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterPolicy {
    /// Hold the checkpoint before the chunk until an operator intervenes.
    #[default]
    Halt,
    /// Record the event as permanently skipped and let the checkpoint advance.
    Skip,
}

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// HTTP JSON-RPC URL of the source chain (eth_blockNumber, eth_getLogs).
    pub rpc_url: String,
    /// Relay service endpoint that accepts transfer payloads.
    pub relayer_url: String,
    /// Bridge contract address (log filter).
    pub contract_address: Address,
    /// topic0 of the event to scan for.
    pub event_selector: B256,
    /// Label for the source chain carried in relay payloads.
    pub source_chain: String,
    /// Delay between ticks once caught up.
    pub poll_interval: Duration,
    /// Max block range per eth_getLogs request.
    pub max_chunk_span: u64,
    /// Confirmations required before a block is scanned.
    pub reorg_margin: u64,
    /// Timeout for each RPC call.
    pub rpc_timeout: Duration,
    pub retry: RetryConfig,
    pub backoff: BackoffConfig,
    pub dead_letter_policy: DeadLetterPolicy,
    /// Recognized destination chain ids; events for others are rejected.
    pub supported_destinations: Vec<u64>,
    pub checkpoint_path: PathBuf,
    /// JSON Lines file receiving dead-lettered events, if set.
    pub dead_letter_path: Option<PathBuf>,
    /// Upper bound on identities kept in the recently-seen dedup set.
    pub recent_capacity: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            relayer_url: "https://httpbin.org/post".into(),
            contract_address: Address::ZERO,
            event_selector: TOKENS_LOCKED_TOPIC0,
            source_chain: "ethereum-sepolia".into(),
            poll_interval: Duration::from_secs(15),
            max_chunk_span: 100,
            reorg_margin: DEFAULT_REORG_MARGIN,
            rpc_timeout: Duration::from_secs(15),
            retry: RetryConfig::default(),
            backoff: BackoffConfig::default(),
            dead_letter_policy: DeadLetterPolicy::default(),
            supported_destinations: DEFAULT_DESTINATION_CHAINS.to_vec(),
            checkpoint_path: PathBuf::from("last_processed_block.json"),
            dead_letter_path: None,
            recent_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} max delay must not be below its base delay")]
    CapBelowBase(&'static str),
    #[error("at least one supported destination chain id is required")]
    NoDestinations,
}

impl ListenerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_span == 0 {
            return Err(ConfigError::Zero("max_chunk_span"));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Zero("poll_interval"));
        }
        if self.rpc_timeout.is_zero() {
            return Err(ConfigError::Zero("rpc_timeout"));
        }
        if self.recent_capacity == 0 {
            return Err(ConfigError::Zero("recent_capacity"));
        }
        if self.supported_destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }
        self.retry.validate()?;
        self.backoff.validate()
    }
}

/// Per-event relay retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempts per event before it is dead-lettered.
    pub max_attempts: u32,
    /// Timeout for a single delivery attempt; expiry counts as a retryable failure.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            attempt_timeout: Duration::from_secs(15),
        }
    }
}

impl RetryConfig {
    /// Delay after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential(self.base_delay, self.max_delay, attempt)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("retry.max_attempts"));
        }
        if self.attempt_timeout.is_zero() {
            return Err(ConfigError::Zero("retry.attempt_timeout"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::CapBelowBase("retry"));
        }
        Ok(())
    }
}

/// Scanner ERROR_BACKOFF policy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
    /// Consecutive failed ticks tolerated before the loop gives up.
    pub max_consecutive_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_jitter: Duration::from_millis(500),
            max_consecutive_failures: 10,
        }
    }
}

impl BackoffConfig {
    /// Delay after `failures` consecutive failed ticks, without jitter.
    pub fn delay_for(&self, failures: u32) -> Duration {
        exponential(self.initial, self.max, failures)
    }

    /// [Self::delay_for] plus up to `max_jitter` of random jitter.
    pub fn jittered(&self, failures: u32) -> Duration {
        let max_jitter = self.max_jitter.as_millis() as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..max_jitter)
        };
        self.delay_for(failures) + Duration::from_millis(jitter)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Zero("backoff.max_consecutive_failures"));
        }
        if self.max < self.initial {
            return Err(ConfigError::CapBelowBase("backoff"));
        }
        Ok(())
    }
}

fn exponential(base: Duration, cap: Duration, n: u32) -> Duration {
    let factor = 1u32.checked_shl(n.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}
