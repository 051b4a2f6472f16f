//! EventNormalizer: raw logs in, validated and deduplicated transfers out.
//!
//! Invalid entries are dropped and recorded for audit; they never block a chunk. Dedup key is
//! `(transaction_hash, log_index)`, checked within the chunk and against identities handed off
//! in recently completed chunks (kept for one reorg margin).

use crate::abi::{DecodeError, EventDecoder};
use crate::event::{BridgeTransferEvent, EventId, RawLogEntry};
use alloy::primitives::U256;
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Why a raw entry was dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("undecodable payload: {0}")]
    Decode(#[from] DecodeError),
    #[error("sender is the zero address")]
    ZeroSender,
    #[error("recipient is the zero address")]
    ZeroRecipient,
    #[error("amount must be greater than zero")]
    ZeroAmount,
    #[error("destination chain {0} is not supported")]
    UnsupportedDestination(U256),
}

/// Audit record for a dropped entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejected {
    pub id: EventId,
    pub block_number: u64,
    pub error: ValidationError,
}

/// Result of normalizing one chunk.
#[derive(Debug, Default)]
pub struct Normalized {
    /// Valid events in ascending `(block_number, log_index)` order.
    pub events: Vec<BridgeTransferEvent>,
    pub rejected: Vec<Rejected>,
    /// Entries suppressed as repeats.
    pub duplicates: usize,
}

/// Identities handed off in recently completed chunks.
///
/// Holds identities from blocks within `margin` of the newest committed block, and at most
/// `capacity` of them (oldest blocks evicted first).
#[derive(Debug)]
pub struct RecentlySeen {
    margin: u64,
    capacity: usize,
    by_block: BTreeMap<u64, Vec<EventId>>,
    ids: HashSet<EventId>,
}

impl RecentlySeen {
    pub fn new(margin: u64, capacity: usize) -> Self {
        Self {
            margin,
            capacity,
            by_block: BTreeMap::new(),
            ids: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &EventId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Record identities from a completed chunk ending at `up_to`, then prune.
    pub fn remember<I>(&mut self, entries: I, up_to: u64)
    where
        I: IntoIterator<Item = (u64, EventId)>,
    {
        for (block, id) in entries {
            if self.ids.insert(id) {
                self.by_block.entry(block).or_default().push(id);
            }
        }
        let cutoff = up_to.saturating_sub(self.margin);
        let kept = self.by_block.split_off(&cutoff);
        for id in std::mem::replace(&mut self.by_block, kept).into_values().flatten() {
            self.ids.remove(&id);
        }
        while self.ids.len() > self.capacity {
            match self.by_block.pop_first() {
                Some((_, evicted)) => {
                    for id in evicted {
                        self.ids.remove(&id);
                    }
                }
                None => break,
            }
        }
    }
}

/// Converts a chunk's raw logs into validated, deduplicated [BridgeTransferEvent]s.
pub struct EventNormalizer {
    decoder: Box<dyn EventDecoder>,
    supported_destinations: HashSet<u64>,
    seen: RecentlySeen,
}

impl EventNormalizer {
    pub fn new(
        decoder: Box<dyn EventDecoder>,
        supported_destinations: impl IntoIterator<Item = u64>,
        margin: u64,
        capacity: usize,
    ) -> Self {
        Self {
            decoder,
            supported_destinations: supported_destinations.into_iter().collect(),
            seen: RecentlySeen::new(margin, capacity),
        }
    }

    pub fn recently_seen(&self) -> &RecentlySeen {
        &self.seen
    }

    /// Validate and dedupe `entries`. Does not touch the recently-seen set; call
    /// [Self::commit] once the chunk's checkpoint is persisted.
    pub fn normalize(&self, mut entries: Vec<RawLogEntry>) -> Normalized {
        entries.sort_by_key(|e| (e.block_number, e.log_index));
        let mut out = Normalized::default();
        let mut in_chunk = HashSet::with_capacity(entries.len());
        for entry in &entries {
            let id = entry.id();
            if !in_chunk.insert(id) || self.seen.contains(&id) {
                tracing::debug!(token = %id, block = entry.block_number, "duplicate log suppressed");
                out.duplicates += 1;
                continue;
            }
            match self.validate(entry) {
                Ok(ev) => out.events.push(ev),
                Err(error) => {
                    tracing::warn!(
                        target: "listener::audit",
                        token = %id,
                        block = entry.block_number,
                        reason = %error,
                        "event rejected"
                    );
                    out.rejected.push(Rejected {
                        id,
                        block_number: entry.block_number,
                        error,
                    });
                }
            }
        }
        out
    }

    /// Mark a completed chunk's events as handed off.
    pub fn commit(&mut self, events: &[BridgeTransferEvent], up_to: u64) {
        self.seen
            .remember(events.iter().map(|e| (e.source_block_number, e.id)), up_to);
    }

    fn validate(&self, entry: &RawLogEntry) -> Result<BridgeTransferEvent, ValidationError> {
        let fields = self.decoder.decode(entry)?;
        if fields.sender.is_zero() {
            return Err(ValidationError::ZeroSender);
        }
        if fields.recipient.is_zero() {
            return Err(ValidationError::ZeroRecipient);
        }
        if fields.amount.is_zero() {
            return Err(ValidationError::ZeroAmount);
        }
        let destination_chain_id = u64::try_from(fields.destination_chain_id)
            .ok()
            .filter(|id| self.supported_destinations.contains(id))
            .ok_or(ValidationError::UnsupportedDestination(
                fields.destination_chain_id,
            ))?;
        Ok(BridgeTransferEvent {
            id: entry.id(),
            sender: fields.sender,
            recipient: fields.recipient,
            amount: fields.amount,
            destination_chain_id,
            source_block_number: entry.block_number,
        })
    }
}
