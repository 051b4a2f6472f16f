//! Relay boundary and RelayDispatcher.
//!
//! Every attempt carries the event's idempotency token, so the relay service collapses repeated
//! deliveries into one effective action. The dispatcher retries retryable failures with capped
//! exponential backoff and dead-letters an event once its attempt budget is spent.

use crate::config::{DeadLetterPolicy, RetryConfig};
use crate::event::{BridgeTransferEvent, EventId, RelayPayload};
use async_trait::async_trait;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

/// Header carrying the idempotency token on every relay request.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    /// Transport errors, timeouts, 408/429/5xx. Worth another attempt.
    #[error("retryable relay failure: {0}")]
    Retryable(String),
    /// The relay refused the payload; further attempts cannot succeed.
    #[error("fatal relay failure: {0}")]
    Fatal(String),
}

/// Downstream relay service.
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Hand off `payload` under `token`. `Ok(())` is an acknowledgement, including "already
    /// processed under this token".
    async fn deliver(&self, token: &str, payload: &RelayPayload) -> Result<(), RelayError>;
}

/// POSTs payloads as JSON to the relay service.
pub struct HttpRelayClient {
    client: reqwest::Client,
    url: String,
}

impl HttpRelayClient {
    pub fn new(url: impl Into<String>) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| RelayError::Fatal(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn deliver(&self, token: &str, payload: &RelayPayload) -> Result<(), RelayError> {
        let resp = self
            .client
            .post(&self.url)
            .header(IDEMPOTENCY_HEADER, token)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_builder() {
                    RelayError::Fatal(format!("invalid request: {}", e))
                } else {
                    RelayError::Retryable(format!("HTTP request failed: {}", e))
                }
            })?;
        let status = resp.status();
        // 409: the relay already holds an action under this token.
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        let reason = format!("HTTP status {}: {}", status, body.chars().take(200).collect::<String>());
        if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
        {
            Err(RelayError::Retryable(reason))
        } else {
            Err(RelayError::Fatal(reason))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStatus {
    Pending,
    Delivered,
    DeadLettered,
}

/// Delivery state of one event while its chunk is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRecord {
    pub id: EventId,
    pub block_number: u64,
    pub attempts: u32,
    pub status: RelayStatus,
    pub last_error: Option<RelayError>,
}

impl RelayRecord {
    fn pending(event: &BridgeTransferEvent) -> Self {
        Self {
            id: event.id,
            block_number: event.source_block_number,
            attempts: 0,
            status: RelayStatus::Pending,
            last_error: None,
        }
    }
}

/// How dispatch of a chunk ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkVerdict {
    /// Every event is Delivered, or DeadLettered under the skip policy.
    Complete,
    /// An event was dead-lettered under the halt policy; later events were not attempted.
    Halted { id: EventId, block: u64 },
    /// Shutdown was requested before every event was attempted.
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct ChunkDelivery {
    pub records: Vec<RelayRecord>,
    pub verdict: ChunkVerdict,
}

impl ChunkDelivery {
    pub fn delivered(&self) -> usize {
        self.count(RelayStatus::Delivered)
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(RelayStatus::DeadLettered)
    }

    fn count(&self, status: RelayStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }
}

/// One line of the dead-letter file.
#[derive(Debug, Serialize)]
struct DeadLetterEntry<'a> {
    token: String,
    block: u64,
    attempts: u32,
    last_error: String,
    policy: DeadLetterPolicy,
    event: &'a RelayPayload,
}

/// Append-only JSON Lines file of dead-lettered events.
#[derive(Debug, Clone)]
pub struct DeadLetterLog {
    path: PathBuf,
}

impl DeadLetterLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &DeadLetterEntry<'_>) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        f.write_all(&line)?;
        f.sync_data()
    }
}

/// Delivers normalized events through a [RelayClient].
pub struct RelayDispatcher {
    client: Arc<dyn RelayClient>,
    retry: RetryConfig,
    policy: DeadLetterPolicy,
    source_chain: String,
    dead_letters: Option<DeadLetterLog>,
}

impl RelayDispatcher {
    pub fn new(
        client: Arc<dyn RelayClient>,
        retry: RetryConfig,
        policy: DeadLetterPolicy,
        source_chain: impl Into<String>,
    ) -> Self {
        Self {
            client,
            retry,
            policy,
            source_chain: source_chain.into(),
            dead_letters: None,
        }
    }

    pub fn with_dead_letter_log(mut self, log: DeadLetterLog) -> Self {
        self.dead_letters = Some(log);
        self
    }

    pub fn policy(&self) -> DeadLetterPolicy {
        self.policy
    }

    /// Deliver one event until it is acknowledged or dead-lettered. Always returns a record in a
    /// terminal state.
    pub async fn dispatch(&self, event: &BridgeTransferEvent) -> RelayRecord {
        let token = event.id.token();
        let payload = RelayPayload::from_event(event, &self.source_chain);
        let mut record = RelayRecord::pending(event);
        loop {
            record.attempts += 1;
            let result = match timeout(
                self.retry.attempt_timeout,
                self.client.deliver(&token, &payload),
            )
            .await
            {
                Ok(r) => r,
                Err(_) => Err(RelayError::Retryable(format!(
                    "attempt timed out after {:?}",
                    self.retry.attempt_timeout
                ))),
            };
            match result {
                Ok(()) => {
                    tracing::debug!(%token, attempt = record.attempts, "relay acknowledged");
                    record.status = RelayStatus::Delivered;
                    record.last_error = None;
                    return record;
                }
                Err(e @ RelayError::Fatal(_)) => {
                    record.last_error = Some(e);
                    break;
                }
                Err(e) => {
                    tracing::warn!(%token, attempt = record.attempts, reason = %e, "relay attempt failed");
                    record.last_error = Some(e);
                    if record.attempts >= self.retry.max_attempts {
                        break;
                    }
                    sleep(self.retry.delay_for(record.attempts)).await;
                }
            }
        }
        record.status = RelayStatus::DeadLettered;
        self.dead_letter(&record, &payload);
        record
    }

    /// Dispatch a chunk's events in order. `shutdown` is checked before each event; an event
    /// already started always reaches a terminal state.
    pub async fn dispatch_chunk(
        &self,
        events: &[BridgeTransferEvent],
        shutdown: &watch::Receiver<bool>,
    ) -> ChunkDelivery {
        let mut records = Vec::with_capacity(events.len());
        for event in events {
            if *shutdown.borrow() {
                return ChunkDelivery {
                    records,
                    verdict: ChunkVerdict::Interrupted,
                };
            }
            let record = self.dispatch(event).await;
            let halt = record.status == RelayStatus::DeadLettered
                && self.policy == DeadLetterPolicy::Halt;
            records.push(record);
            if halt {
                return ChunkDelivery {
                    records,
                    verdict: ChunkVerdict::Halted {
                        id: event.id,
                        block: event.source_block_number,
                    },
                };
            }
        }
        ChunkDelivery {
            records,
            verdict: ChunkVerdict::Complete,
        }
    }

    fn dead_letter(&self, record: &RelayRecord, payload: &RelayPayload) {
        let last_error = record
            .last_error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        match self.policy {
            DeadLetterPolicy::Halt => tracing::error!(
                target: "listener::audit",
                token = %record.id,
                block = record.block_number,
                attempts = record.attempts,
                reason = %last_error,
                "event dead-lettered; checkpoint held until operator action"
            ),
            DeadLetterPolicy::Skip => tracing::error!(
                target: "listener::audit",
                token = %record.id,
                block = record.block_number,
                attempts = record.attempts,
                reason = %last_error,
                "event dead-lettered and permanently skipped"
            ),
        }
        if let Some(log) = &self.dead_letters {
            let entry = DeadLetterEntry {
                token: record.id.token(),
                block: record.block_number,
                attempts: record.attempts,
                last_error,
                policy: self.policy,
                event: payload,
            };
            if let Err(e) = log.append(&entry) {
                tracing::error!(path = %log.path().display(), reason = %e, "failed to write dead-letter file");
            }
        }
    }
}
