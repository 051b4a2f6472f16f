//! ChainConnector: the scanner's view of the source chain.
//!
//! [HttpConnector] speaks Ethereum JSON-RPC over HTTP (eth_blockNumber, eth_getLogs). Every
//! failure is classified as transient (retry the same window) or fatal (abort).

use crate::abi::{decode_rpc_log, is_removed, log_matches_topic0, parse_hex_u64};
use crate::event::RawLogEntry;
use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectorError {
    /// Timeouts, rate limits, 5xx, node-side RPC errors. The window is retried unchanged.
    #[error("transient RPC failure: {0}")]
    Transient(String),
    /// Misconfiguration or protocol mismatch. Retrying cannot help.
    #[error("fatal RPC failure: {0}")]
    Fatal(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectorError::Transient(_))
    }
}

/// Source of chain tip height and raw logs.
#[async_trait]
pub trait ChainConnector: Send + Sync {
    async fn latest_block_number(&self) -> Result<u64, ConnectorError>;

    /// Logs with topic0 `selector` in `from..=to`.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        selector: B256,
    ) -> Result<Vec<RawLogEntry>, ConnectorError>;
}

/// JSON-RPC call failure: either the node answered with an error object, or the call itself
/// failed.
enum CallError {
    Rejected(Value),
    Failed(ConnectorError),
}

impl From<ConnectorError> for CallError {
    fn from(e: ConnectorError) -> Self {
        CallError::Failed(e)
    }
}

impl From<CallError> for ConnectorError {
    fn from(e: CallError) -> Self {
        match e {
            CallError::Rejected(err) => ConnectorError::Transient(format!("RPC error: {}", err)),
            CallError::Failed(e) => e,
        }
    }
}

fn build_logs_filter(address: &Address, topic0: Option<&B256>, from: u64, to: u64) -> Value {
    let mut filter = json!({
        "address": format!("0x{}", hex::encode(address)),
        "fromBlock": format!("0x{:x}", from),
        "toBlock": format!("0x{:x}", to),
    });
    // Single-topic filter: [topic0] only (some nodes reject [topic0, null, null, null]).
    if let Some(t0) = topic0 {
        filter["topics"] = json!([format!("0x{}", hex::encode(t0))]);
    }
    filter
}

fn classify_reqwest(e: reqwest::Error) -> ConnectorError {
    if e.is_builder() {
        ConnectorError::Fatal(format!("invalid request: {}", e))
    } else {
        ConnectorError::Transient(format!("HTTP request failed: {}", e))
    }
}

fn classify_status(status: reqwest::StatusCode) -> ConnectorError {
    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
    {
        ConnectorError::Transient(format!("HTTP status {}", status))
    } else {
        ConnectorError::Fatal(format!("HTTP status {}", status))
    }
}

/// HTTP JSON-RPC connector for EVM chains.
pub struct HttpConnector {
    client: reqwest::Client,
    url: String,
    contract_address: Address,
    call_timeout: Duration,
    next_id: AtomicU64,
}

impl HttpConnector {
    pub fn new(
        url: impl Into<String>,
        contract_address: Address,
        call_timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| ConnectorError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
            contract_address,
            call_timeout,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params
        });
        match timeout(self.call_timeout, self.send(&body)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::Failed(ConnectorError::Transient(format!(
                "{} timed out after {:?}",
                method, self.call_timeout
            )))),
        }
    }

    async fn send(&self, body: &Value) -> Result<Value, CallError> {
        let resp = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(classify_reqwest)?;
        if !resp.status().is_success() {
            return Err(classify_status(resp.status()).into());
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| ConnectorError::Transient(format!("parse response: {}", e)))?;
        if let Some(err) = json.get("error") {
            return Err(CallError::Rejected(err.clone()));
        }
        json.get("result")
            .cloned()
            .ok_or_else(|| ConnectorError::Fatal("Missing result".into()).into())
    }

    async fn get_logs_raw(&self, filter: Value) -> Result<Vec<Value>, CallError> {
        let result = self.call("eth_getLogs", json!([filter])).await?;
        result
            .as_array()
            .cloned()
            .ok_or_else(|| CallError::Failed(ConnectorError::Fatal("getLogs not array".into())))
    }
}

#[async_trait]
impl ChainConnector for HttpConnector {
    async fn latest_block_number(&self) -> Result<u64, ConnectorError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let s = result
            .as_str()
            .ok_or_else(|| ConnectorError::Fatal("blockNumber not string".into()))?;
        parse_hex_u64(s).map_err(|e| ConnectorError::Fatal(e.to_string()))
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        selector: B256,
    ) -> Result<Vec<RawLogEntry>, ConnectorError> {
        let filter = build_logs_filter(&self.contract_address, Some(&selector), from, to);
        let logs = match self.get_logs_raw(filter).await {
            Ok(logs) => logs,
            Err(CallError::Rejected(err)) => {
                tracing::debug!(%err, from, to, "eth_getLogs with topic filter rejected, trying address-only");
                let fallback = build_logs_filter(&self.contract_address, None, from, to);
                self.get_logs_raw(fallback)
                    .await?
                    .into_iter()
                    .filter(|log| log_matches_topic0(log, &selector))
                    .collect()
            }
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|log| !is_removed(log)) {
            // A log without a block number or index is still pending on the node; retry later.
            let entry = decode_rpc_log(log)
                .map_err(|e| ConnectorError::Transient(format!("eth_getLogs entry: {}", e)))?;
            entries.push(entry);
        }
        tracing::debug!(count = entries.len(), from, to, "fetched logs");
        Ok(entries)
    }
}
