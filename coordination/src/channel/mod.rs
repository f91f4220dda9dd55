//! Synchronization channel between the driver and its out-of-process peers.
//!
//! The only thing the driver shares with operators, pipeline steps or a
//! worker is a durable, eventually consistent key/value store. This module
//! turns that store into a request/response channel:
//!
//! ```text
//! put(key, value)          ── write, retried on transient failure
//! get(key)                 ── single check, "" reads as absent
//! wait_for(key, poll)      ── get in a bounded poll loop, Timeout past the deadline
//! consume(key, poll)       ── wait_for + claim, so no second reader sees the value
//! consume_any(keys, poll)  ── consume whichever key shows up first
//! try_consume(key)         ── single check + claim
//! ```
//!
//! Keys must be exchange-unique (see [`ExchangeKey`]): writing a key again
//! before its previous value was consumed is a caller bug, not something the
//! channel detects.
//!
//! Timing uses `tokio::time`, so tests drive the poll loop with a paused
//! clock.

pub mod key;
pub mod metadata;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use key::{ExchangeKey, KeyError};
pub use metadata::AgentMetadataStore;
pub use store::{ExchangeStore, FileStore, MemoryStore, StoreError};

/// Errors surfaced by channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel unavailable for '{key}' after {attempts} attempts: {source}")]
    Unavailable {
        key: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("Timed out after {waited:?} waiting for '{key}'")]
    Timeout { key: String, waited: Duration },

    #[error("Invalid exchange key: {0}")]
    InvalidKey(String),
}

impl From<KeyError> for ChannelError {
    fn from(e: KeyError) -> Self {
        Self::InvalidKey(e.to_string())
    }
}

impl ChannelError {
    /// The key the failing operation addressed.
    pub fn key(&self) -> &str {
        match self {
            Self::Unavailable { key, .. } | Self::Timeout { key, .. } => key,
            Self::InvalidKey(key) => key,
        }
    }
}

/// Bounded retry for transient store failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts per operation, including the first (minimum 1).
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Backoff multiplier (1.0 for a fixed delay).
    pub backoff_multiplier: f64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Fixed delay between attempts.
    pub fn fixed(max_attempts: u32, backoff: Duration) -> Self {
        let ms = backoff.as_millis() as u64;
        Self {
            max_attempts,
            initial_backoff_ms: ms,
            backoff_multiplier: 1.0,
            max_backoff_ms: ms,
        }
    }

    /// Backoff before retry number `retry` (1-indexed; 0 means no delay).
    pub fn backoff_ms(&self, retry: u32) -> u64 {
        if retry == 0 {
            return 0;
        }
        let delay = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(retry as i32 - 1);
        (delay as u64).min(self.max_backoff_ms)
    }

    pub fn backoff_duration(&self, retry: u32) -> Duration {
        Duration::from_millis(self.backoff_ms(retry))
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 500ms fixed backoff.
    fn default() -> Self {
        Self::fixed(3, Duration::from_millis(500))
    }
}

/// How long and how often a blocking read polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub timeout: Duration,
    pub interval: Duration,
}

impl PollPolicy {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }
}

/// Request/response channel over an [`ExchangeStore`].
#[derive(Clone)]
pub struct SyncChannel {
    store: Arc<dyn ExchangeStore>,
    retry: RetryPolicy,
    namespace: Option<String>,
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("store", &self.store.describe())
            .field("retry", &self.retry)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl SyncChannel {
    pub fn new(store: Arc<dyn ExchangeStore>) -> Self {
        Self {
            store,
            retry: RetryPolicy::default(),
            namespace: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Prefix every key with `namespace.` so concurrent runs sharing one
    /// store never see each other's records.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Result<Self, ChannelError> {
        let namespace = namespace.into();
        let valid = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(ChannelError::InvalidKey(namespace));
        }
        self.namespace = Some(namespace);
        Ok(self)
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }

    /// The key as it is stored, including any namespace.
    pub fn qualify(&self, key: &ExchangeKey) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}.{key}"),
            None => key.to_string(),
        }
    }

    /// Run one store operation with bounded retries on transient failure.
    async fn with_retries<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T, ChannelError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.retry.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::InvalidKey(k)) => return Err(ChannelError::InvalidKey(k)),
                Err(e) if !e.is_transient() || retry + 1 >= attempts => {
                    let attempts = retry + 1;
                    tracing::error!(key, attempts, error = %e, "Channel store unavailable");
                    return Err(ChannelError::Unavailable {
                        key: key.to_string(),
                        attempts,
                        source: e,
                    });
                }
                Err(e) => {
                    retry += 1;
                    tracing::warn!(key, retry, error = %e, "Transient channel failure, retrying");
                    tokio::time::sleep(self.retry.backoff_duration(retry)).await;
                }
            }
        }
    }

    /// Write `value` under `key`. Visible to `get` once this returns.
    pub async fn put(&self, key: &ExchangeKey, value: &str) -> Result<(), ChannelError> {
        let qualified = self.qualify(key);
        self.with_retries(&qualified, || self.store.write(&qualified, value))
            .await?;
        tracing::debug!(key = %qualified, "Channel put");
        Ok(())
    }

    /// Single check. Absent and empty values both read as `None`.
    pub async fn get(&self, key: &ExchangeKey) -> Result<Option<String>, ChannelError> {
        let qualified = self.qualify(key);
        let value = self
            .with_retries(&qualified, || self.store.read(&qualified))
            .await?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    /// Poll `get` until a value appears or `poll.timeout` elapses.
    ///
    /// Fails with `Timeout` no earlier than the deadline and no later than
    /// one poll interval past it.
    pub async fn wait_for(
        &self,
        key: &ExchangeKey,
        poll: PollPolicy,
    ) -> Result<String, ChannelError> {
        let started = Instant::now();
        let deadline = started + poll.timeout;
        tracing::debug!(key = %key, timeout = ?poll.timeout, "Waiting for channel value");
        loop {
            if let Some(value) = self.get(key).await? {
                return Ok(value);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout(key, started));
            }
            tokio::time::sleep(poll.interval.min(deadline - now)).await;
        }
    }

    /// `wait_for` followed by an irreversible claim of the record.
    ///
    /// If another reader claims the record between the observation and the
    /// claim, polling continues until the deadline.
    pub async fn consume(
        &self,
        key: &ExchangeKey,
        poll: PollPolicy,
    ) -> Result<String, ChannelError> {
        self.consume_any(std::slice::from_ref(key), poll)
            .await
            .map(|(_, value)| value)
    }

    /// Claim whichever of `keys` becomes available first.
    ///
    /// Keys are checked in order on every poll, so an earlier key wins when
    /// several are present. Returns the index of the claimed key.
    pub async fn consume_any(
        &self,
        keys: &[ExchangeKey],
        poll: PollPolicy,
    ) -> Result<(usize, String), ChannelError> {
        let started = Instant::now();
        let deadline = started + poll.timeout;
        loop {
            for (idx, key) in keys.iter().enumerate() {
                if self.get(key).await?.is_none() {
                    continue;
                }
                match self.try_consume(key).await? {
                    Some(value) => return Ok((idx, value)),
                    None => {
                        tracing::debug!(key = %key, "Record claimed by another reader, still waiting")
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                let names: Vec<String> = keys.iter().map(|k| self.qualify(k)).collect();
                return Err(ChannelError::Timeout {
                    key: names.join("|"),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(poll.interval.min(deadline - now)).await;
        }
    }

    /// Claim the record if it is there right now.
    pub async fn try_consume(&self, key: &ExchangeKey) -> Result<Option<String>, ChannelError> {
        let qualified = self.qualify(key);
        let value = self
            .with_retries(&qualified, || self.store.take(&qualified))
            .await?;
        if value.is_some() {
            tracing::debug!(key = %qualified, "Channel record consumed");
        }
        Ok(value.filter(|v| !v.is_empty()))
    }

    fn timeout(&self, key: &ExchangeKey, started: Instant) -> ChannelError {
        ChannelError::Timeout {
            key: self.qualify(key),
            waited: started.elapsed(),
        }
    }
}
