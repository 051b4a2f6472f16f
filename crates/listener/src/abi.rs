//! ABI for the bridge contract's TokensLocked event.
//!
//! Decodes JSON-RPC log objects (eth_getLogs result entries) into [RawLogEntry] and raw
//! entries into [CandidateFields] via the [EventDecoder] seam.

use crate::event::RawLogEntry;
use alloy::primitives::{Address, Bytes, LogData, B256, U256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use serde_json::Value;
use thiserror::Error;

sol! {
    /// Emitted by the bridge contract when tokens are locked for a cross-chain transfer.
    #[derive(Debug, PartialEq, Eq)]
    event TokensLocked(
        address indexed sender,
        address indexed recipient,
        uint256 amount,
        uint256 indexed destinationChainId,
        bytes32 sourceTxHash
    );
}

/// keccak256("TokensLocked(address,address,uint256,uint256,bytes32)").
pub const TOKENS_LOCKED_TOPIC0: B256 = <TokensLocked as SolEvent>::SIGNATURE_HASH;

/// Fields decoded from a log, not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFields {
    pub sender: Address,
    pub recipient: Address,
    pub amount: U256,
    pub destination_chain_id: U256,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed log: {0}")]
    Malformed(String),
    #[error("ABI decode failed: {0}")]
    Abi(String),
}

/// Turns a raw log into candidate transfer fields.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, entry: &RawLogEntry) -> Result<CandidateFields, DecodeError>;
}

/// Decoder for [TokensLocked]; rejects logs whose topic0 is not the TokensLocked signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokensLockedDecoder;

impl EventDecoder for TokensLockedDecoder {
    fn decode(&self, entry: &RawLogEntry) -> Result<CandidateFields, DecodeError> {
        let log = LogData::new(entry.topics.clone(), entry.data.clone()).ok_or_else(|| {
            DecodeError::Malformed(format!("{} topics exceeds the EVM limit", entry.topics.len()))
        })?;
        let ev = TokensLocked::decode_log_data(&log, true)
            .map_err(|e| DecodeError::Abi(e.to_string()))?;
        Ok(CandidateFields {
            sender: ev.sender,
            recipient: ev.recipient,
            amount: ev.amount,
            destination_chain_id: ev.destinationChainId,
        })
    }
}

/// Decode one JSON-RPC log object into a [RawLogEntry].
pub fn decode_rpc_log(log_value: &Value) -> Result<RawLogEntry, DecodeError> {
    let block_number = parse_hex_u64(field_str(log_value, "blockNumber")?)?;
    let log_index = parse_hex_u64(field_str(log_value, "logIndex")?)?;
    let transaction_hash = parse_b256(field_str(log_value, "transactionHash")?)?;
    let address = parse_address(field_str(log_value, "address")?)?;
    let data = Bytes::from(parse_hex_bytes(field_str(log_value, "data")?)?);
    let topics = log_value
        .get("topics")
        .and_then(|t| t.as_array())
        .ok_or_else(|| DecodeError::Malformed("Missing topics".into()))?
        .iter()
        .map(|t| {
            t.as_str()
                .ok_or_else(|| DecodeError::Malformed("topic not str".into()))
                .and_then(parse_b256)
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(RawLogEntry {
        block_number,
        transaction_hash,
        log_index,
        address,
        topics,
        data,
    })
}

/// True if the node flagged the log as removed by a reorg.
pub fn is_removed(log_value: &Value) -> bool {
    log_value
        .get("removed")
        .and_then(|r| r.as_bool())
        .unwrap_or(false)
}

/// True if the log's topic0 equals `topic0` (client-side filter for address-only queries).
pub fn log_matches_topic0(log_value: &Value, topic0: &B256) -> bool {
    log_value
        .get("topics")
        .and_then(|t| t.as_array())
        .and_then(|t| t.first())
        .and_then(|t| t.as_str())
        .and_then(|s| parse_b256(s).ok())
        .map(|t| &t == topic0)
        .unwrap_or(false)
}

fn field_str<'a>(log_value: &'a Value, key: &str) -> Result<&'a str, DecodeError> {
    log_value
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| DecodeError::Malformed(format!("Missing {}", key)))
}

pub(crate) fn parse_hex_u64(s: &str) -> Result<u64, DecodeError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| DecodeError::Malformed(format!("parse hex u64: {}", e)))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, DecodeError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| DecodeError::Malformed(format!("parse hex bytes: {}", e)))
}

fn parse_b256(s: &str) -> Result<B256, DecodeError> {
    let bytes = parse_hex_bytes(s)?;
    if bytes.len() != 32 {
        return Err(DecodeError::Malformed(format!(
            "Expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    Ok(B256::from_slice(&bytes))
}

fn parse_address(s: &str) -> Result<Address, DecodeError> {
    let bytes = parse_hex_bytes(s)?;
    match bytes.len() {
        20 => Ok(Address::from_slice(&bytes)),
        // Left-padded 32-byte word; take the last 20.
        32 => Ok(Address::from_slice(&bytes[12..32])),
        n => Err(DecodeError::Malformed(format!(
            "Expected 20 or 32 bytes for address, got {}",
            n
        ))),
    }
}
