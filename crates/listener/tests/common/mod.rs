//! Common helpers for integration tests: in-memory chain, relay and checkpoint doubles.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use alloy::primitives::{Address, B256, U256};
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use listener::{
    BackoffConfig, ChainConnector, Checkpoint, CheckpointError, CheckpointStore, ConnectorError,
    ListenerConfig, RawLogEntry, RelayClient, RelayError, RelayPayload, RetryConfig, Scanner,
    Shutdown, TokensLocked,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fast retry/backoff settings; margin 10, chunk span 100, destinations 1 and 137.
pub fn test_config() -> ListenerConfig {
    ListenerConfig {
        contract_address: Address::repeat_byte(0xaa),
        poll_interval: Duration::from_secs(1),
        max_chunk_span: 100,
        reorg_margin: 10,
        retry: RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(1),
        },
        backoff: BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            max_jitter: Duration::ZERO,
            max_consecutive_failures: 3,
        },
        supported_destinations: vec![1, 137],
        ..Default::default()
    }
}

/// Transaction hash unique per `(block, log_index)`.
pub fn tx_hash(block: u64, log_index: u64) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[16..24].copy_from_slice(&block.to_be_bytes());
    bytes[24..].copy_from_slice(&log_index.to_be_bytes());
    B256::from(bytes)
}

/// TokensLocked log as the connector would return it.
pub fn transfer_log(block: u64, log_index: u64, amount: u64, destination: u64) -> RawLogEntry {
    let data = TokensLocked {
        sender: Address::repeat_byte(0x11),
        recipient: Address::repeat_byte(0x22),
        amount: U256::from(amount),
        destinationChainId: U256::from(destination),
        sourceTxHash: B256::ZERO,
    }
    .encode_log_data();
    RawLogEntry {
        block_number: block,
        transaction_hash: tx_hash(block, log_index),
        log_index,
        address: Address::repeat_byte(0xaa),
        topics: data.topics().to_vec(),
        data: data.data,
    }
}

/// Idempotency token of [transfer_log]`(block, log_index, ..)`.
pub fn token(block: u64, log_index: u64) -> String {
    transfer_log(block, log_index, 1, 1).id().token()
}

#[derive(Default)]
struct ChainState {
    tip: u64,
    logs: Vec<RawLogEntry>,
    tip_failures: VecDeque<ConnectorError>,
    logs_failures: VecDeque<ConnectorError>,
    range_failures: HashMap<u64, VecDeque<ConnectorError>>,
    requested: Vec<(u64, u64)>,
    tip_calls: usize,
    overlap: u64,
}

/// In-memory chain: settable tip, stored logs, scripted failures.
#[derive(Default)]
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new(tip: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.set_tip(tip);
        Arc::new(chain)
    }

    pub fn set_tip(&self, tip: u64) {
        self.state.lock().unwrap().tip = tip;
    }

    pub fn add_log(&self, log: RawLogEntry) {
        self.state.lock().unwrap().logs.push(log);
    }

    /// Fail the next `n` eth_blockNumber calls with `err`.
    pub fn fail_tip(&self, n: usize, err: ConnectorError) {
        let mut s = self.state.lock().unwrap();
        s.tip_failures.extend(std::iter::repeat(err).take(n));
    }

    /// Fail the next `n` eth_getLogs calls with `err`.
    pub fn fail_logs(&self, n: usize, err: ConnectorError) {
        let mut s = self.state.lock().unwrap();
        s.logs_failures.extend(std::iter::repeat(err).take(n));
    }

    /// Fail the next `n` eth_getLogs calls whose range starts at `from`.
    pub fn fail_range(&self, from: u64, n: usize, err: ConnectorError) {
        let mut s = self.state.lock().unwrap();
        s.range_failures
            .entry(from)
            .or_default()
            .extend(std::iter::repeat(err).take(n));
    }

    /// Also return logs up to `blocks` below each requested range.
    pub fn set_overlap(&self, blocks: u64) {
        self.state.lock().unwrap().overlap = blocks;
    }

    /// Every get_logs range requested, failed calls included.
    pub fn requested(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().requested.clone()
    }

    pub fn tip_calls(&self) -> usize {
        self.state.lock().unwrap().tip_calls
    }
}

#[async_trait]
impl ChainConnector for MockChain {
    async fn latest_block_number(&self) -> Result<u64, ConnectorError> {
        let mut s = self.state.lock().unwrap();
        s.tip_calls += 1;
        match s.tip_failures.pop_front() {
            Some(e) => Err(e),
            None => Ok(s.tip),
        }
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        selector: B256,
    ) -> Result<Vec<RawLogEntry>, ConnectorError> {
        let mut s = self.state.lock().unwrap();
        s.requested.push((from, to));
        if let Some(e) = s.logs_failures.pop_front() {
            return Err(e);
        }
        if let Some(e) = s.range_failures.get_mut(&from).and_then(|q| q.pop_front()) {
            return Err(e);
        }
        let lo = from.saturating_sub(s.overlap);
        Ok(s
            .logs
            .iter()
            .filter(|l| l.block_number >= lo && l.block_number <= to)
            .filter(|l| l.topics.first() == Some(&selector))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct RelayState {
    attempts: Vec<String>,
    effective: Vec<RelayPayload>,
    scripted: HashMap<String, VecDeque<RelayError>>,
    always_fail: HashSet<String>,
    lose_ack: HashSet<String>,
    shutdown_after: Option<(usize, Shutdown)>,
}

/// Relay boundary that collapses repeated tokens into one effective action.
#[derive(Default)]
pub struct MockRelay {
    state: Mutex<RelayState>,
}

impl MockRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reply to `token` with `errors` in order before accepting it.
    pub fn script(&self, token: &str, errors: impl IntoIterator<Item = RelayError>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(token.to_string())
            .or_default()
            .extend(errors);
    }

    /// Every attempt for `token` fails as retryable.
    pub fn always_fail(&self, token: &str) {
        self.state.lock().unwrap().always_fail.insert(token.to_string());
    }

    /// Accept `token` but report a retryable failure on the first delivery.
    pub fn lose_ack_once(&self, token: &str) {
        self.state.lock().unwrap().lose_ack.insert(token.to_string());
    }

    /// Trigger `shutdown` once `n` distinct events have been accepted.
    pub fn shutdown_after(&self, n: usize, shutdown: Shutdown) {
        self.state.lock().unwrap().shutdown_after = Some((n, shutdown));
    }

    /// Tokens of every delivery attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.state.lock().unwrap().attempts.clone()
    }

    pub fn attempts_for(&self, token: &str) -> usize {
        self.attempts().iter().filter(|t| *t == token).count()
    }

    /// Tokens of accepted events, once each, in acceptance order.
    pub fn effective_tokens(&self) -> Vec<String> {
        let s = self.state.lock().unwrap();
        s.effective.iter().map(|p| p.idempotency_key.clone()).collect()
    }

    /// `(block, log_index)` of accepted events, in acceptance order.
    pub fn effective_positions(&self) -> Vec<(u64, u64)> {
        let s = self.state.lock().unwrap();
        s.effective
            .iter()
            .map(|p| (p.data.source_block_number, p.data.log_index))
            .collect()
    }
}

#[async_trait]
impl RelayClient for MockRelay {
    async fn deliver(&self, token: &str, payload: &RelayPayload) -> Result<(), RelayError> {
        let mut s = self.state.lock().unwrap();
        s.attempts.push(token.to_string());
        if s.always_fail.contains(token) {
            return Err(RelayError::Retryable("HTTP status 503".into()));
        }
        if let Some(e) = s.scripted.get_mut(token).and_then(|q| q.pop_front()) {
            return Err(e);
        }
        assert_eq!(payload.idempotency_key, token, "payload carries the header token");
        if !s.effective.iter().any(|p| p.idempotency_key == token) {
            s.effective.push(payload.clone());
        }
        if let Some((n, shutdown)) = &s.shutdown_after {
            if s.effective.len() >= *n {
                shutdown.trigger();
            }
        }
        if s.lose_ack.remove(token) {
            return Err(RelayError::Retryable("connection reset before response".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    current: Option<Checkpoint>,
    saves: Vec<u64>,
}

/// Checkpoint store shared between the scanner and the test.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    pub fn at(block: u64) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().current = Some(Checkpoint::new(block));
        store
    }

    pub fn current(&self) -> Option<u64> {
        self.state.lock().unwrap().current.map(|c| c.last_confirmed_block)
    }

    /// Every value saved by the scanner, seed included.
    pub fn saves(&self) -> Vec<u64> {
        self.state.lock().unwrap().saves.clone()
    }
}

impl CheckpointStore for MemoryStore {
    fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.state.lock().unwrap().current)
    }

    fn save(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let mut s = self.state.lock().unwrap();
        if let Some(current) = s.current {
            if checkpoint < current {
                return Err(CheckpointError::Regression {
                    current: current.last_confirmed_block,
                    attempted: checkpoint.last_confirmed_block,
                });
            }
        }
        s.current = Some(checkpoint);
        s.saves.push(checkpoint.last_confirmed_block);
        Ok(())
    }

    fn rollback(&mut self, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        self.state.lock().unwrap().current = Some(checkpoint);
        Ok(())
    }
}

pub fn scanner(
    config: ListenerConfig,
    chain: &Arc<MockChain>,
    relay: &Arc<MockRelay>,
    store: Box<dyn CheckpointStore>,
) -> Scanner {
    Scanner::builder(config)
        .connector(chain.clone())
        .relay(relay.clone())
        .checkpoint_store(store)
        .build()
        .expect("scanner builds")
}
