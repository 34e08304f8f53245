use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::{
    CasOutcome, MeshStore, RawMessage, StoreError, StoreResult, StoreStats, StoreSubscription,
    StoreTopic, StoredEntry,
};

const DEFAULT_QUEUE_DEPTH: usize = 64;

/// In-process reference backend.
///
/// Entries live behind one RwLock so version assignment and conditional swaps
/// are atomic with respect to each other. Pub/sub fan-out is a registry of
/// bounded senders; a full subscriber queue drops the frame for that
/// subscriber only.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

struct Inner {
    entries: RwLock<HashMap<String, StoredEntry>>,
    subscribers: Mutex<Vec<SubscriberSlot>>,
    next_subscriber: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    queue_depth: usize,
}

struct SubscriberSlot {
    id: u64,
    topic: StoreTopic,
    matcher: Option<GlobMatcher>,
    sender: mpsc::Sender<RawMessage>,
}

impl SubscriberSlot {
    fn matches(&self, channel: &str) -> bool {
        match (&self.topic, &self.matcher) {
            (StoreTopic::Exact(name), _) => name == channel,
            (StoreTopic::Pattern(_), Some(matcher)) => matcher.is_match(channel),
            (StoreTopic::Pattern(_), None) => false,
        }
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("entries", &self.inner.entries.read().unwrap().len())
            .field("subscribers", &self.inner.subscribers.lock().unwrap().len())
            .finish()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    /// Queue depth bounds how far a subscriber may fall behind before frames
    /// are dropped for it.
    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                queue_depth: queue_depth.max(1),
            }),
        }
    }

    fn compile_topic(topic: &StoreTopic) -> StoreResult<Option<GlobMatcher>> {
        match topic {
            StoreTopic::Exact(_) => Ok(None),
            StoreTopic::Pattern(raw) => {
                let glob = Glob::new(raw).map_err(|err| StoreError::InvalidTopic {
                    topic: raw.clone(),
                    detail: err.to_string(),
                })?;
                Ok(Some(glob.compile_matcher()))
            }
        }
    }
}

#[async_trait]
impl MeshStore for MemStore {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        let entries = self.inner.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.clone()))
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, digest: String) -> StoreResult<u64> {
        let mut entries = self.inner.entries.write().unwrap();
        let version = entries.get(key).map(|e| e.version).unwrap_or(0) + 1;
        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                version,
                digest,
            },
        );
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        digest: String,
    ) -> StoreResult<CasOutcome> {
        let mut entries = self.inner.entries.write().unwrap();
        let current = entries.get(key);
        let holds = match (current, expected) {
            (None, None) => true,
            (Some(entry), Some(bytes)) => entry.value == bytes,
            _ => false,
        };
        if !holds {
            return Ok(CasOutcome::Mismatch);
        }
        let version = current.map(|e| e.version).unwrap_or(0) + 1;
        entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                version,
                digest,
            },
        );
        Ok(CasOutcome::Swapped { version })
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut entries = self.inner.entries.write().unwrap();
        Ok(entries.remove(key).is_some())
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>> {
        let entries = self.inner.entries.read().unwrap();
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect())
    }

    async fn publish(&self, channel: &str, frame: &[u8]) -> StoreResult<usize> {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        // Closed receivers are reaped on the way through.
        subscribers.retain(|slot| !slot.sender.is_closed());
        let mut receivers = 0;
        for slot in subscribers.iter() {
            if !slot.matches(channel) {
                continue;
            }
            receivers += 1;
            let message = RawMessage {
                channel: channel.to_string(),
                payload: frame.to_vec(),
            };
            if let Err(mpsc::error::TrySendError::Full(_)) = slot.sender.try_send(message) {
                warn!(
                    topic = slot.topic.as_str(),
                    channel, "subscriber queue full, dropping frame"
                );
            }
        }
        Ok(receivers)
    }

    async fn subscribe(&self, topic: StoreTopic) -> StoreResult<StoreSubscription> {
        let matcher = Self::compile_topic(&topic)?;
        let (sender, receiver) = mpsc::channel(self.inner.queue_depth);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1;
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        subscribers.push(SubscriberSlot {
            id,
            topic: topic.clone(),
            matcher,
            sender,
        });
        Ok(StoreSubscription {
            id,
            topic,
            receiver,
        })
    }

    async fn unsubscribe(&self, id: u64) -> StoreResult<bool> {
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|slot| slot.id != id);
        Ok(subscribers.len() < before)
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let entries = self.inner.entries.read().unwrap();
        let approx_value_bytes = entries.values().map(|e| e.value.len() as u64).sum();
        Ok(StoreStats {
            entries: entries.len() as u64,
            approx_value_bytes,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
        })
    }
}
