//! Storage adapter boundary for the semantic mesh.
//!
//! The coordination layer is backend-agnostic: every networked key-value /
//! pub-sub backend is consumed through the [`MeshStore`] trait and nothing
//! above this crate sees a raw driver error. [`MemStore`] is the in-process
//! reference backend; [`FlakyStore`] injects transient failures for tests.

mod mem;
mod mock;
mod retry;

pub use mem::MemStore;
pub use mock::FlakyStore;
pub use retry::{RetryPolicy, retry};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type StoreResult<T> = Result<T, StoreError>;

/// A stored entry: opaque value bytes plus version and digest bookkeeping.
///
/// `version` is a monotonic per-key write counter assigned by the store; it is
/// never 0 for a present key (0 is reserved to mean "absent"). `digest` is the
/// lowercase hex SHA-256 of `value`, computed by the writer and verified by
/// readers to detect corruption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub value: Vec<u8>,
    pub version: u64,
    pub digest: String,
}

/// Outcome of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expectation held; the new value is stored at `version`.
    Swapped { version: u64 },
    /// The stored value differed from the expectation; nothing changed.
    Mismatch,
}

impl CasOutcome {
    pub fn swapped(&self) -> bool {
        matches!(self, CasOutcome::Swapped { .. })
    }
}

/// Subscription addressing: a literal channel name or a glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreTopic {
    Exact(String),
    Pattern(String),
}

impl StoreTopic {
    /// Classify a raw subscription string: wildcard characters make it a
    /// pattern topic, anything else subscribes the literal channel.
    pub fn from_channel(raw: &str) -> Self {
        if raw.contains('*') || raw.contains('?') {
            StoreTopic::Pattern(raw.to_string())
        } else {
            StoreTopic::Exact(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StoreTopic::Exact(s) | StoreTopic::Pattern(s) => s,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, StoreTopic::Pattern(_))
    }
}

impl std::fmt::Display for StoreTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw frame delivered to a subscriber, before envelope parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Receiving side of a store subscription.
///
/// The store pushes matching frames into the bounded queue. A consumer that
/// falls behind loses frames rather than blocking publishers.
#[derive(Debug)]
pub struct StoreSubscription {
    /// Store-assigned registration id; release it with
    /// [`MeshStore::unsubscribe`].
    pub id: u64,
    pub topic: StoreTopic,
    pub receiver: mpsc::Receiver<RawMessage>,
}

/// Counters reported by [`MeshStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub entries: u64,
    pub approx_value_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient backend failure; callers may retry.
    #[error("store unavailable: {detail}")]
    Unavailable { detail: String },
    /// Permanent backend failure.
    #[error("store internal error: {detail}")]
    Internal { detail: String },
    #[error("invalid topic '{topic}': {detail}")]
    InvalidTopic { topic: String, detail: String },
}

impl StoreError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        StoreError::Unavailable {
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        StoreError::Internal {
            detail: detail.into(),
        }
    }

    /// Whether a bounded retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// Primitive operations every mesh backend supplies.
///
/// Version assignment happens inside the backend's atomic write section:
/// `put` and `compare_and_swap` return the new version and callers never
/// compute versions themselves. `compare_and_swap` with `expected = None`
/// succeeds only if the key is absent (create-if-absent).
#[async_trait]
pub trait MeshStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>>;

    /// Unconditional write (last-writer-wins). Returns the new version.
    async fn put(&self, key: &str, value: Vec<u8>, digest: String) -> StoreResult<u64>;

    /// Conditional write: applies only if the stored value equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        digest: String,
    ) -> StoreResult<CasOutcome>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All entries whose key starts with `prefix`; an empty prefix scans
    /// everything. Order is unspecified.
    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>>;

    /// Fan a frame out to current subscribers; returns the receiver count.
    async fn publish(&self, channel: &str, frame: &[u8]) -> StoreResult<usize>;

    async fn subscribe(&self, topic: StoreTopic) -> StoreResult<StoreSubscription>;

    /// Releases the registration with the given id; returns whether it
    /// existed. Ids are unique per store, so sibling subscriptions of the
    /// same topic stay attached.
    async fn unsubscribe(&self, id: u64) -> StoreResult<bool>;

    async fn stats(&self) -> StoreResult<StoreStats>;
}
