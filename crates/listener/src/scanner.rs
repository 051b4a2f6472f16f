//! ScannerLoop: the tick-driven state machine tying the pipeline together.
//!
//! ```text
//! INIT -> {CATCHING_UP, STEADY} -> WAITING -> (tick) -> {CATCHING_UP, STEADY} -> ...
//!            any active state -> ERROR_BACKOFF -> (tick) -> ...
//!            shutdown -> SHUTTING_DOWN
//! ```
//!
//! Each chunk is fetched, normalized and dispatched in order. The checkpoint moves to the chunk's
//! last block only once every event in it reached a terminal outcome; a failed chunk is retried
//! from scratch on the next tick.

use crate::abi::{EventDecoder, TokensLockedDecoder};
use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore};
use crate::config::{ConfigError, ListenerConfig};
use crate::connector::{ChainConnector, ConnectorError, HttpConnector};
use crate::guard::ReorgGuard;
use crate::normalizer::EventNormalizer;
use crate::planner::{split, Chunk, ScanWindow};
use crate::relay::{ChunkVerdict, DeadLetterLog, HttpRelayClient, RelayClient, RelayDispatcher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Init,
    CatchingUp,
    Steady,
    Waiting,
    ErrorBackoff,
    ShuttingDown,
}

/// Result of one [Scanner::tick].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No final block beyond the checkpoint.
    Idle { checkpoint: u64, ceiling: u64 },
    /// The window `from..=to` was scanned and the checkpoint now sits at `to`.
    Advanced {
        from: u64,
        to: u64,
        chunks: usize,
        delivered: usize,
        rejected: usize,
        skipped: usize,
    },
    /// Shutdown was observed; the checkpoint is the last completed chunk's.
    Interrupted { checkpoint: Option<u64> },
}

impl TickOutcome {
    /// How long to wait before the next tick; `None` once the scanner should stop.
    pub fn next_delay(&self, poll_interval: Duration) -> Option<Duration> {
        match self {
            TickOutcome::Interrupted { .. } => None,
            _ => Some(poll_interval),
        }
    }
}

#[derive(Debug, Error)]
pub enum ScannerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("setup failed: {0}")]
    Setup(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("event {token} in block {block} was dead-lettered; checkpoint held before its chunk")]
    DeadLetterHalt { token: String, block: u64 },

    #[error("giving up after {failures} consecutive failed ticks: {last}")]
    Exhausted { failures: u32, last: Box<ScannerError> },
}

impl ScannerError {
    /// Transient errors send the loop to ERROR_BACKOFF; anything else stops it.
    pub fn is_transient(&self) -> bool {
        match self {
            ScannerError::Connector(e) => e.is_transient(),
            ScannerError::Checkpoint(CheckpointError::Io(_)) => true,
            ScannerError::DeadLetterHalt { .. } => true,
            _ => false,
        }
    }

    /// Process exit code: 1 for configuration and setup failures, 2 for unrecoverable runtime
    /// failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            ScannerError::Config(_) | ScannerError::Setup(_) => 1,
            ScannerError::Checkpoint(CheckpointError::Corrupt { .. })
            | ScannerError::Checkpoint(CheckpointError::Locked(_)) => 1,
            _ => 2,
        }
    }
}

/// Cloneable handle that asks a running [Scanner] to stop.
#[derive(Debug, Clone)]
pub struct Shutdown(Arc<watch::Sender<bool>>);

impl Shutdown {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

/// Assembles a [Scanner]. Collaborators not supplied are built from the config.
pub struct ScannerBuilder {
    config: ListenerConfig,
    connector: Option<Arc<dyn ChainConnector>>,
    relay: Option<Arc<dyn RelayClient>>,
    store: Option<Box<dyn CheckpointStore>>,
    decoder: Option<Box<dyn EventDecoder>>,
}

impl ScannerBuilder {
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            connector: None,
            relay: None,
            store: None,
            decoder: None,
        }
    }

    pub fn connector(mut self, connector: Arc<dyn ChainConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn relay(mut self, relay: Arc<dyn RelayClient>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn checkpoint_store(mut self, store: Box<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn decoder(mut self, decoder: Box<dyn EventDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn build(self) -> Result<Scanner, ScannerError> {
        let config = self.config;
        config.validate()?;

        let connector: Arc<dyn ChainConnector> = match self.connector {
            Some(c) => c,
            None => Arc::new(
                HttpConnector::new(&config.rpc_url, config.contract_address, config.rpc_timeout)
                    .map_err(|e| ScannerError::Setup(e.to_string()))?,
            ),
        };
        let relay: Arc<dyn RelayClient> = match self.relay {
            Some(r) => r,
            None => Arc::new(
                HttpRelayClient::new(&config.relayer_url)
                    .map_err(|e| ScannerError::Setup(e.to_string()))?,
            ),
        };
        let store = match self.store {
            Some(s) => s,
            None => Box::new(FileCheckpointStore::open(&config.checkpoint_path).map_err(
                |e| match e {
                    CheckpointError::Io(e) => ScannerError::Setup(format!(
                        "cannot open checkpoint store {}: {}",
                        config.checkpoint_path.display(),
                        e
                    )),
                    other => ScannerError::Checkpoint(other),
                },
            )?),
        };
        let decoder = self
            .decoder
            .unwrap_or_else(|| Box::new(TokensLockedDecoder));

        let normalizer = EventNormalizer::new(
            decoder,
            config.supported_destinations.iter().copied(),
            config.reorg_margin,
            config.recent_capacity,
        );
        let mut dispatcher = RelayDispatcher::new(
            relay,
            config.retry.clone(),
            config.dead_letter_policy,
            config.source_chain.clone(),
        );
        if let Some(path) = &config.dead_letter_path {
            dispatcher = dispatcher.with_dead_letter_log(DeadLetterLog::new(path));
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Scanner {
            guard: ReorgGuard::new(config.reorg_margin),
            config,
            connector,
            normalizer,
            dispatcher,
            store,
            state: ScannerState::Init,
            checkpoint: None,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        })
    }
}

/// Per-chunk tallies.
#[derive(Debug, Default)]
struct ChunkStats {
    delivered: usize,
    rejected: usize,
    skipped: usize,
}

pub struct Scanner {
    config: ListenerConfig,
    connector: Arc<dyn ChainConnector>,
    normalizer: EventNormalizer,
    dispatcher: RelayDispatcher,
    store: Box<dyn CheckpointStore>,
    guard: ReorgGuard,
    state: ScannerState,
    checkpoint: Option<Checkpoint>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scanner {
    pub fn builder(config: ListenerConfig) -> ScannerBuilder {
        ScannerBuilder::new(config)
    }

    pub fn state(&self) -> ScannerState {
        self.state
    }

    /// Checkpoint as of the last completed chunk; `None` before INIT.
    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown(self.shutdown_tx.clone())
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// One state-machine step: scan everything final beyond the checkpoint. Never sleeps
    /// between chunks; waiting is left to [Self::run].
    pub async fn tick(&mut self) -> Result<TickOutcome, ScannerError> {
        let result = self.step().await;
        if result.is_err() {
            self.state = ScannerState::ErrorBackoff;
        }
        result
    }

    async fn step(&mut self) -> Result<TickOutcome, ScannerError> {
        if self.shutdown_requested() {
            return Ok(self.interrupted());
        }
        let loaded = match self.checkpoint {
            Some(c) => Some(c),
            None => self.store.load()?,
        };
        let tip = self.connector.latest_block_number().await?;
        let checkpoint = match loaded {
            Some(c) => c,
            None => self.seed(tip)?,
        };
        self.checkpoint = Some(checkpoint);

        let ceiling = self.guard.safe_ceiling(tip);
        let window = ScanWindow::after(checkpoint.last_confirmed_block, ceiling);
        if window.is_empty() {
            self.state = ScannerState::Waiting;
            tracing::debug!(tip, ceiling, checkpoint = checkpoint.last_confirmed_block, "no final blocks beyond checkpoint");
            return Ok(TickOutcome::Idle {
                checkpoint: checkpoint.last_confirmed_block,
                ceiling,
            });
        }

        let chunks = split(window, self.config.max_chunk_span);
        self.state = if chunks.len() > 1 {
            ScannerState::CatchingUp
        } else {
            ScannerState::Steady
        };
        tracing::info!(
            from = window.from_block,
            to = window.to_block,
            tip,
            chunks = chunks.len(),
            state = ?self.state,
            "scanning window"
        );

        let mut totals = ChunkStats::default();
        for chunk in &chunks {
            if self.shutdown_requested() {
                return Ok(self.interrupted());
            }
            match self.process_chunk(*chunk).await? {
                Some(stats) => {
                    totals.delivered += stats.delivered;
                    totals.rejected += stats.rejected;
                    totals.skipped += stats.skipped;
                }
                None => return Ok(self.interrupted()),
            }
        }
        self.state = ScannerState::Waiting;
        Ok(TickOutcome::Advanced {
            from: window.from_block,
            to: window.to_block,
            chunks: chunks.len(),
            delivered: totals.delivered,
            rejected: totals.rejected,
            skipped: totals.skipped,
        })
    }

    /// First run: start at the current safe ceiling instead of replaying history.
    fn seed(&mut self, tip: u64) -> Result<Checkpoint, ScannerError> {
        let seed = Checkpoint::new(self.guard.safe_ceiling(tip));
        self.store.save(seed)?;
        tracing::info!(tip, checkpoint = seed.last_confirmed_block, "no checkpoint found; seeded");
        Ok(seed)
    }

    /// `Ok(None)` if shutdown interrupted dispatch; the checkpoint is then left untouched.
    async fn process_chunk(&mut self, chunk: Chunk) -> Result<Option<ChunkStats>, ScannerError> {
        let mut raw = self
            .connector
            .get_logs(chunk.from_block, chunk.to_block, self.config.event_selector)
            .await?;
        // Nodes may pad the range. Entries below it are already checkpointed; entries past it
        // belong to a later chunk and may not be final yet.
        raw.retain(|e| (chunk.from_block..=chunk.to_block).contains(&e.block_number));
        let normalized = self.normalizer.normalize(raw);
        let delivery = self
            .dispatcher
            .dispatch_chunk(&normalized.events, &self.shutdown_rx)
            .await;

        match delivery.verdict {
            ChunkVerdict::Complete => {}
            ChunkVerdict::Interrupted => {
                tracing::info!(
                    from = chunk.from_block,
                    to = chunk.to_block,
                    dispatched = delivery.records.len(),
                    "shutdown mid-chunk; checkpoint not advanced"
                );
                return Ok(None);
            }
            ChunkVerdict::Halted { id, block } => {
                return Err(ScannerError::DeadLetterHalt {
                    token: id.token(),
                    block,
                });
            }
        }

        let next = Checkpoint::new(chunk.to_block);
        self.store.save(next)?;
        self.checkpoint = Some(next);
        self.normalizer.commit(&normalized.events, chunk.to_block);

        let stats = ChunkStats {
            delivered: delivery.delivered(),
            rejected: normalized.rejected.len(),
            skipped: delivery.dead_lettered(),
        };
        tracing::info!(
            from = chunk.from_block,
            to = chunk.to_block,
            delivered = stats.delivered,
            rejected = stats.rejected,
            skipped = stats.skipped,
            duplicates = normalized.duplicates,
            "chunk complete; checkpoint advanced"
        );
        Ok(Some(stats))
    }

    fn interrupted(&mut self) -> TickOutcome {
        self.state = ScannerState::ShuttingDown;
        TickOutcome::Interrupted {
            checkpoint: self.checkpoint.map(|c| c.last_confirmed_block),
        }
    }

    /// Drive ticks until shutdown or an unrecoverable error.
    ///
    /// Transient failures back off exponentially with jitter; after
    /// `backoff.max_consecutive_failures` in a row the loop returns [ScannerError::Exhausted].
    pub async fn run(&mut self) -> Result<(), ScannerError> {
        let mut shutdown = self.shutdown_rx.clone();
        let mut failures = 0u32;
        loop {
            let delay = match self.tick().await {
                Ok(outcome) => match outcome.next_delay(self.config.poll_interval) {
                    Some(delay) => {
                        failures = 0;
                        delay
                    }
                    None => break,
                },
                Err(e) if e.is_transient() => {
                    failures += 1;
                    if failures >= self.config.backoff.max_consecutive_failures {
                        tracing::error!(failures, reason = %e, "scanner giving up");
                        return Err(ScannerError::Exhausted {
                            failures,
                            last: Box::new(e),
                        });
                    }
                    let delay = self.config.backoff.jittered(failures);
                    tracing::warn!(
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        reason = %e,
                        "tick failed, backing off"
                    );
                    delay
                }
                Err(e) => {
                    tracing::error!(reason = %e, "scanner aborted");
                    return Err(e);
                }
            };
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        self.state = ScannerState::ShuttingDown;
        tracing::info!(
            checkpoint = ?self.checkpoint.map(|c| c.last_confirmed_block),
            "scanner stopped"
        );
        Ok(())
    }
}
