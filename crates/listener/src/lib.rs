//! Bridge event listener: reorg-safe scanning and checkpointed relay of TokensLocked events.
//!
//! - **Scanner**: tick-driven state machine. Reads only blocks at least `reorg_margin` below the
//!   tip ([ReorgGuard]), splits the window into bounded chunks ([split]), and advances the
//!   [Checkpoint] past a chunk only after every event in it reached a terminal outcome.
//! - **EventNormalizer**: decodes, validates and deduplicates raw logs by
//!   `(transaction_hash, log_index)`.
//! - **RelayDispatcher**: idempotent handoff to the relay service with bounded retry and
//!   dead-lettering ([DeadLetterPolicy] decides whether a dead letter holds the checkpoint).

pub mod abi;
pub mod checkpoint;
pub mod config;
pub mod connector;
pub mod event;
pub mod guard;
pub mod normalizer;
pub mod planner;
pub mod relay;
pub mod scanner;

pub use abi::{CandidateFields, DecodeError, EventDecoder, TokensLocked, TokensLockedDecoder, TOKENS_LOCKED_TOPIC0};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, FileCheckpointStore};
pub use config::{
    BackoffConfig, ConfigError, DeadLetterPolicy, ListenerConfig, RetryConfig,
    DEFAULT_DESTINATION_CHAINS,
};
pub use connector::{ChainConnector, ConnectorError, HttpConnector};
pub use event::{BridgeTransferEvent, EventId, RawLogEntry, RelayPayload, TransferData};
pub use guard::{safe_ceiling, ReorgGuard, DEFAULT_REORG_MARGIN};
pub use normalizer::{EventNormalizer, Normalized, RecentlySeen, Rejected, ValidationError};
pub use planner::{split, Chunk, ScanWindow};
pub use relay::{
    ChunkDelivery, ChunkVerdict, DeadLetterLog, HttpRelayClient, RelayClient, RelayDispatcher,
    RelayError, RelayRecord, RelayStatus, IDEMPOTENCY_HEADER,
};
pub use scanner::{Scanner, ScannerBuilder, ScannerError, ScannerState, Shutdown, TickOutcome};
