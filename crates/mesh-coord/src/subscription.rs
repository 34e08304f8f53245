use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mesh_acl::time::{Clock, unix_seconds};
use mesh_store::{MeshStore, RawMessage, StoreTopic, retry};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::envelope::MessageEnvelope;
use crate::error::{CapacityKind, MeshError, MeshResult};

/// One parsed message handed to a subscription handler.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub channel: String,
    pub envelope: MessageEnvelope,
}

/// How a handler failed. `Fatal` deactivates the subscription immediately;
/// `Transient` deactivates once the subscription's message count lands on a
/// nonzero multiple of the configured failure-check interval.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("transient handler failure: {0}")]
    Transient(String),
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn transient(detail: impl Into<String>) -> Self {
        HandlerError::Transient(detail.into())
    }

    pub fn fatal(detail: impl Into<String>) -> Self {
        HandlerError::Fatal(detail.into())
    }
}

/// Consumer side of a subscription. A failing or panicking handler is
/// isolated to its own subscription's worker task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError>;
}

/// Point-in-time view of one subscription's bookkeeping.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: String,
    pub pattern: String,
    pub created_at: SystemTime,
    pub message_count: u64,
    pub last_message_at: SystemTime,
    pub active: bool,
}

/// Aggregate bookkeeping over current subscriptions.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStats {
    pub total: usize,
    pub active: usize,
    pub total_messages: u64,
    pub average_messages: f64,
    pub oldest_age_secs: f64,
    pub newest_age_secs: f64,
}

/// Per-channel result of a broadcast.
#[derive(Debug)]
pub enum BroadcastOutcome {
    Delivered { receivers: usize },
    Failed { error: MeshError },
}

impl BroadcastOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, BroadcastOutcome::Delivered { .. })
    }
}

struct SubscriptionEntry {
    id: String,
    pattern: String,
    /// Store-assigned registration id; releasing it severs exactly this
    /// subscription's feed.
    store_id: u64,
    created_at: SystemTime,
    message_count: AtomicU64,
    last_message_at: Mutex<SystemTime>,
    active: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEntry {
    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            pattern: self.pattern.clone(),
            created_at: self.created_at,
            message_count: self.message_count.load(Ordering::Relaxed),
            last_message_at: *self.last_message_at.lock().unwrap(),
            active: self.active.load(Ordering::SeqCst),
        }
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn abort_worker(&self) {
        if let Some(worker) = self.worker.lock().unwrap().take() {
            worker.abort();
        }
    }
}

/// Registers subscriptions, owns their worker tasks and carries the
/// publish, broadcast and cleanup paths.
///
/// Store I/O is decoupled from handler execution: the store feeds each
/// subscription's bounded queue, and a dedicated task drains it.
pub struct SubscriptionManager<S> {
    store: Arc<S>,
    config: MeshConfig,
    clock: Arc<dyn Clock>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionEntry>>>,
}

impl<S: MeshStore> SubscriptionManager<S> {
    pub fn new(store: Arc<S>, config: MeshConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            config,
            clock,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `handler` for `pattern` and returns the subscription id.
    /// Wildcard characters subscribe a pattern topic, anything else the
    /// literal channel.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> MeshResult<String> {
        {
            let subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.contains_key(pattern) {
                return Err(MeshError::SubscriptionFailed {
                    pattern: pattern.to_string(),
                    detail: "already subscribed".to_string(),
                });
            }
            if subscriptions.len() >= self.config.max_subscriptions {
                return Err(MeshError::CapacityExceeded {
                    kind: CapacityKind::Subscriptions,
                    limit: self.config.max_subscriptions,
                });
            }
        }

        let topic = StoreTopic::from_channel(pattern);
        let store_subscription =
            self.store
                .subscribe(topic)
                .await
                .map_err(|err| MeshError::SubscriptionFailed {
                    pattern: pattern.to_string(),
                    detail: err.to_string(),
                })?;

        let now = self.clock.now();
        let entry = Arc::new(SubscriptionEntry {
            id: subscription_id(pattern, now),
            pattern: pattern.to_string(),
            store_id: store_subscription.id,
            created_at: now,
            message_count: AtomicU64::new(0),
            last_message_at: Mutex::new(now),
            active: AtomicBool::new(true),
            worker: Mutex::new(None),
        });
        let worker = tokio::spawn(run_worker(
            Arc::clone(&entry),
            store_subscription.receiver,
            handler,
            Arc::clone(&self.clock),
            self.config.failure_check_interval,
        ));
        *entry.worker.lock().unwrap() = Some(worker);

        // Both pre-checks re-run under the insert lock: a concurrent
        // subscribe may have taken the pattern or the last slot while the
        // store call was in flight.
        let lost_race = {
            let mut subscriptions = self.subscriptions.lock().unwrap();
            if subscriptions.contains_key(pattern) {
                Some(MeshError::SubscriptionFailed {
                    pattern: pattern.to_string(),
                    detail: "already subscribed".to_string(),
                })
            } else if subscriptions.len() >= self.config.max_subscriptions {
                Some(MeshError::CapacityExceeded {
                    kind: CapacityKind::Subscriptions,
                    limit: self.config.max_subscriptions,
                })
            } else {
                subscriptions.insert(pattern.to_string(), Arc::clone(&entry));
                None
            }
        };
        if let Some(rejection) = lost_race {
            entry.deactivate();
            entry.abort_worker();
            if let Err(err) = self.store.unsubscribe(entry.store_id).await {
                tracing::warn!(pattern, "rolling back store registration failed: {err}");
            }
            return Err(rejection);
        }
        tracing::debug!(pattern, id = %entry.id, "subscription registered");
        Ok(entry.id.clone())
    }

    /// Removes the subscription for `pattern`; `Ok(false)` if unknown.
    ///
    /// The store registration is released first; if that fails the local
    /// bookkeeping is untouched, so a later call can retry instead of
    /// leaking the registration.
    pub async fn unsubscribe(&self, pattern: &str) -> MeshResult<bool> {
        let entry = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions.get(pattern).map(Arc::clone)
        };
        let Some(entry) = entry else {
            return Ok(false);
        };
        self.store
            .unsubscribe(entry.store_id)
            .await
            .map_err(|err| MeshError::SubscriptionFailed {
                pattern: pattern.to_string(),
                detail: err.to_string(),
            })?;
        if !self.evict(pattern, &entry) {
            // a concurrent remove got there first
            return Ok(false);
        }
        entry.deactivate();
        entry.abort_worker();
        tracing::debug!(pattern, id = %entry.id, "subscription removed");
        Ok(true)
    }

    /// Removes `pattern`'s map entry only while it is still `expected`;
    /// an entry replaced by a concurrent resubscribe survives sweeps that
    /// collected the old one.
    fn evict(&self, pattern: &str, expected: &Arc<SubscriptionEntry>) -> bool {
        let mut subscriptions = self.subscriptions.lock().unwrap();
        match subscriptions.get(pattern) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                subscriptions.remove(pattern);
                true
            }
            _ => false,
        }
    }

    /// Frames `data` in an envelope and publishes it, retrying transient
    /// store failures per the configured policy. Returns the receiver
    /// count.
    pub async fn publish(&self, channel: &str, data: Value, source: &str) -> MeshResult<usize> {
        let envelope = MessageEnvelope::new(data, unix_seconds(self.clock.now()), source);
        let frame = envelope.frame().map_err(|err| MeshError::PublishFailed {
            channel: channel.to_string(),
            detail: format!("envelope encoding failed: {err}"),
        })?;
        if frame.len() > self.config.max_message_bytes {
            return Err(MeshError::CapacityExceeded {
                kind: CapacityKind::MessageBytes,
                limit: self.config.max_message_bytes,
            });
        }
        retry(self.config.publish_retry, "publish", || {
            let frame = frame.clone();
            async move { self.store.publish(channel, &frame).await }
        })
        .await
        .map_err(|err| {
            tracing::warn!(channel, "publish failed: {err}");
            MeshError::PublishFailed {
                channel: channel.to_string(),
                detail: err.to_string(),
            }
        })
    }

    /// Publishes `data` to every channel independently; a failing channel
    /// never aborts the rest. Every channel appears in the result.
    pub async fn broadcast(
        &self,
        channels: &[&str],
        data: Value,
        source: &str,
    ) -> BTreeMap<String, BroadcastOutcome> {
        let mut outcomes = BTreeMap::new();
        for channel in channels {
            let outcome = match self.publish(channel, data.clone(), source).await {
                Ok(receivers) => BroadcastOutcome::Delivered { receivers },
                Err(error) => {
                    tracing::warn!(channel, "broadcast leg failed: {error}");
                    BroadcastOutcome::Failed { error }
                }
            };
            outcomes.insert((*channel).to_string(), outcome);
        }
        outcomes
    }

    /// Sweeps subscriptions that are deactivated or idle past the
    /// configured timeout, unsubscribing them at the store. Returns the
    /// count removed.
    pub async fn cleanup_inactive(&self) -> usize {
        let now = self.clock.now();
        let stale: Vec<Arc<SubscriptionEntry>> = {
            let subscriptions = self.subscriptions.lock().unwrap();
            subscriptions
                .values()
                .filter(|entry| {
                    if !entry.active.load(Ordering::SeqCst) {
                        return true;
                    }
                    let last = *entry.last_message_at.lock().unwrap();
                    now.duration_since(last)
                        .map(|idle| idle > self.config.idle_timeout)
                        .unwrap_or(false)
                })
                .map(Arc::clone)
                .collect()
        };

        let mut removed = 0;
        for entry in stale {
            if let Err(err) = self.store.unsubscribe(entry.store_id).await {
                // kept for the next sweep to retry
                tracing::warn!(pattern = %entry.pattern, "store unsubscribe during cleanup failed: {err}");
                continue;
            }
            if !self.evict(&entry.pattern, &entry) {
                continue;
            }
            entry.deactivate();
            entry.abort_worker();
            tracing::debug!(pattern = %entry.pattern, id = %entry.id, "stale subscription removed");
            removed += 1;
        }
        removed
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    /// Snapshots per-subscription bookkeeping, ordered by pattern.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let subscriptions = self.subscriptions.lock().unwrap();
        let mut infos: Vec<SubscriptionInfo> =
            subscriptions.values().map(|entry| entry.info()).collect();
        infos.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        infos
    }

    pub fn subscription_stats(&self) -> SubscriptionStats {
        let now = self.clock.now();
        let subscriptions = self.subscriptions.lock().unwrap();
        let total = subscriptions.len();
        let mut active = 0usize;
        let mut total_messages = 0u64;
        let mut oldest_age_secs = 0f64;
        let mut newest_age_secs = f64::INFINITY;
        for entry in subscriptions.values() {
            if entry.active.load(Ordering::SeqCst) {
                active += 1;
            }
            total_messages += entry.message_count.load(Ordering::Relaxed);
            let age = now
                .duration_since(entry.created_at)
                .map(|elapsed| elapsed.as_secs_f64())
                .unwrap_or(0.0);
            oldest_age_secs = oldest_age_secs.max(age);
            newest_age_secs = newest_age_secs.min(age);
        }
        if total == 0 {
            newest_age_secs = 0.0;
        }
        SubscriptionStats {
            total,
            active,
            total_messages,
            average_messages: if total == 0 {
                0.0
            } else {
                total_messages as f64 / total as f64
            },
            oldest_age_secs,
            newest_age_secs,
        }
    }
}

/// Drains one subscription's queue: parse the envelope, stamp the
/// bookkeeping, run the handler, apply the deactivation heuristic.
async fn run_worker(
    entry: Arc<SubscriptionEntry>,
    mut receiver: mpsc::Receiver<RawMessage>,
    handler: Arc<dyn MessageHandler>,
    clock: Arc<dyn Clock>,
    failure_check_interval: u64,
) {
    while let Some(raw) = receiver.recv().await {
        if !entry.active.load(Ordering::SeqCst) {
            break;
        }
        let envelope = match MessageEnvelope::parse(&raw.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(
                    subscription = %entry.id,
                    channel = %raw.channel,
                    "skipping malformed frame: {err}"
                );
                continue;
            }
        };
        let count = entry.message_count.fetch_add(1, Ordering::Relaxed) + 1;
        *entry.last_message_at.lock().unwrap() = clock.now();

        let delivery = Delivery {
            channel: raw.channel,
            envelope,
        };
        match handler.handle(delivery).await {
            Ok(()) => {}
            Err(HandlerError::Fatal(reason)) => {
                tracing::warn!(
                    subscription = %entry.id,
                    "deactivating after fatal handler failure: {reason}"
                );
                entry.deactivate();
                break;
            }
            Err(HandlerError::Transient(reason)) => {
                tracing::debug!(subscription = %entry.id, "transient handler failure: {reason}");
                if failure_check_interval > 0 && count % failure_check_interval == 0 {
                    tracing::warn!(
                        subscription = %entry.id,
                        count,
                        "deactivating after repeated handler failures"
                    );
                    entry.deactivate();
                    break;
                }
            }
        }
    }
}

fn subscription_id(pattern: &str, created_at: SystemTime) -> String {
    let nanos = created_at
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(pattern.as_bytes());
    hasher.update(nanos.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    let fragment = Uuid::new_v4().simple().to_string();
    format!("sub-{}-{}", &digest[..12], &fragment[..8])
}
