//! Domain types flowing through the pipeline: raw logs, event identity, validated transfers,
//! and the JSON payload handed to the relay service.

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::Serialize;
use std::fmt;

/// Identity of one log on the source chain: `(transaction_hash, log_index)`.
///
/// Globally unique and stable across reconnects, chunk retries and restarts. Used as the
/// dedup key in the normalizer and as the idempotency token at the relay boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    pub transaction_hash: B256,
    pub log_index: u64,
}

impl EventId {
    pub fn new(transaction_hash: B256, log_index: u64) -> Self {
        Self {
            transaction_hash,
            log_index,
        }
    }

    /// Idempotency token sent with every delivery attempt: `0x<tx_hash>:<log_index>`.
    pub fn token(&self) -> String {
        format!("0x{}:{}", hex::encode(self.transaction_hash), self.log_index)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Log entry as returned by a [crate::ChainConnector]; payload still ABI-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLogEntry {
    pub block_number: u64,
    pub transaction_hash: B256,
    pub log_index: u64,
    /// Contract that emitted the log.
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

impl RawLogEntry {
    pub fn id(&self) -> EventId {
        EventId::new(self.transaction_hash, self.log_index)
    }
}

/// A validated TokensLocked transfer. Immutable once built by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeTransferEvent {
    pub id: EventId,
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub destination_chain_id: u64,
    pub source_block_number: u64,
}

impl BridgeTransferEvent {
    /// Dispatch order key.
    pub fn position(&self) -> (u64, u64) {
        (self.source_block_number, self.id.log_index)
    }
}

/// Transfer fields of a [RelayPayload].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferData {
    pub sender: String,
    pub recipient: String,
    /// Decimal string; uint256 does not fit a JSON number.
    pub amount: String,
    pub source_tx_hash: String,
    pub log_index: u64,
    pub source_block_number: u64,
}

/// JSON body posted to the relay service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelayPayload {
    pub source_chain: String,
    pub destination_chain_id: u64,
    pub idempotency_key: String,
    pub data: TransferData,
}

impl RelayPayload {
    pub fn from_event(ev: &BridgeTransferEvent, source_chain: &str) -> Self {
        Self {
            source_chain: source_chain.to_string(),
            destination_chain_id: ev.destination_chain_id,
            idempotency_key: ev.id.token(),
            data: TransferData {
                sender: ev.sender.to_string(),
                recipient: ev.recipient.to_string(),
                amount: ev.amount.to_string(),
                source_tx_hash: format!("0x{}", hex::encode(ev.id.transaction_hash)),
                log_index: ev.id.log_index,
                source_block_number: ev.source_block_number,
            },
        }
    }
}
