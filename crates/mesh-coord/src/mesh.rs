use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use mesh_acl::{
    ADMIN_NAMESPACE, AccessGate, AuditLog, CallerContext, CapabilityLedger, Clock, KeyPattern,
    LedgerConfig, MeshKey, Operation, SystemClock,
};
use mesh_store::{CasOutcome, MeshStore};
use serde::Serialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use crate::config::MeshConfig;
use crate::error::{CapacityKind, MeshError, MeshResult};
use crate::subscription::{
    BroadcastOutcome, MessageHandler, SubscriptionInfo, SubscriptionManager, SubscriptionStats,
};

/// Channel prefix for change events, completed by the namespace.
pub const EVENTS_CHANNEL_PREFIX: &str = "mesh.events.";

/// Counters for one mesh handle: store totals plus subscription
/// bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeshStats {
    pub entries: u64,
    pub approx_value_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub subscriptions: SubscriptionStats,
}

/// The coordination facade: a namespaced, access-controlled, version-tracked
/// key space over a [`MeshStore`], with pattern subscriptions on the side.
///
/// Every operation authorizes against the configured [`AccessGate`] under
/// this handle's [`CallerContext`] before touching the store. Values are
/// opaque bytes; a SHA-256 digest stored alongside each value is verified
/// on read.
pub struct SemanticMesh<S> {
    store: Arc<S>,
    gate: Arc<dyn AccessGate>,
    caller: CallerContext,
    subscriptions: SubscriptionManager<S>,
    config: MeshConfig,
}

impl<S: MeshStore> SemanticMesh<S> {
    /// Canonical wiring: a capability ledger with its default
    /// configuration decides access.
    pub fn new(store: Arc<S>, caller: CallerContext) -> Self {
        Self::with_gate(
            store,
            Arc::new(CapabilityLedger::new(LedgerConfig::default())),
            caller,
            MeshConfig::default(),
        )
    }

    /// Explicit gate selection, e.g. an `AccessController` rule engine.
    pub fn with_gate(
        store: Arc<S>,
        gate: Arc<dyn AccessGate>,
        caller: CallerContext,
        config: MeshConfig,
    ) -> Self {
        Self::with_clock(store, gate, caller, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<S>,
        gate: Arc<dyn AccessGate>,
        caller: CallerContext,
        config: MeshConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let subscriptions = SubscriptionManager::new(Arc::clone(&store), config.clone(), clock);
        Self {
            store,
            gate,
            caller,
            subscriptions,
            config,
        }
    }

    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    /// The audit log behind this handle's gate.
    pub fn audit_log(&self) -> Arc<AuditLog> {
        self.gate.audit()
    }

    fn authorize(&self, key: &MeshKey, operation: Operation) -> MeshResult<()> {
        if self.gate.authorize(key, operation, &self.caller) {
            Ok(())
        } else {
            Err(MeshError::AccessDenied {
                key: key.encoded(),
                operation,
            })
        }
    }

    pub async fn get(&self, key: &str) -> MeshResult<Option<Vec<u8>>> {
        self.get_entry(MeshKey::parse(key)).await
    }

    pub async fn get_in(&self, namespace: &str, name: &str) -> MeshResult<Option<Vec<u8>>> {
        self.get_entry(MeshKey::new(namespace, name)).await
    }

    async fn get_entry(&self, key: MeshKey) -> MeshResult<Option<Vec<u8>>> {
        self.authorize(&key, Operation::Read)?;
        let Some(entry) = self.store.get(&key.encoded()).await? else {
            return Ok(None);
        };
        if digest_of(&entry.value) != entry.digest {
            return Err(MeshError::Corruption {
                key: key.encoded(),
            });
        }
        Ok(Some(entry.value))
    }

    /// Unconditional write (last-writer-wins). Returns the new version.
    pub async fn set(&self, key: &str, value: Vec<u8>) -> MeshResult<u64> {
        self.set_entry(MeshKey::parse(key), value).await
    }

    pub async fn set_in(&self, namespace: &str, name: &str, value: Vec<u8>) -> MeshResult<u64> {
        self.set_entry(MeshKey::new(namespace, name), value).await
    }

    async fn set_entry(&self, key: MeshKey, value: Vec<u8>) -> MeshResult<u64> {
        self.authorize(&key, Operation::Write)?;
        let encoded = key.encoded();
        if self.store.get(&encoded).await?.is_none() {
            let stats = self.store.stats().await?;
            if stats.entries >= self.config.max_entries as u64 {
                return Err(MeshError::CapacityExceeded {
                    kind: CapacityKind::Entries,
                    limit: self.config.max_entries,
                });
            }
        }
        let digest = digest_of(&value);
        let version = self.store.put(&encoded, value, digest).await?;
        self.publish_event(
            key.namespace(),
            json!({
                "event": "set",
                "key": encoded,
                "namespace": key.namespace(),
                "version": version,
            }),
        )
        .await;
        Ok(version)
    }

    /// The one primitive for safe concurrent mutation: applies only when
    /// the stored value still equals `expected` (`None` = key must be
    /// absent). `Ok(false)` on mismatch, with no side effects. Callers
    /// needing read-modify-write loop on `get`/`get_version` plus this.
    pub async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> MeshResult<bool> {
        let key = MeshKey::parse(key);
        self.authorize(&key, Operation::Write)?;
        let digest = digest_of(&value);
        let outcome = self
            .store
            .compare_and_swap(&key.encoded(), expected, value, digest)
            .await?;
        match outcome {
            CasOutcome::Swapped { version } => {
                self.publish_event(
                    key.namespace(),
                    json!({
                        "event": "set",
                        "key": key.encoded(),
                        "namespace": key.namespace(),
                        "version": version,
                    }),
                )
                .await;
                Ok(true)
            }
            CasOutcome::Mismatch => Ok(false),
        }
    }

    /// Current version of a key; 0 for a key never written.
    pub async fn get_version(&self, key: &str) -> MeshResult<u64> {
        let key = MeshKey::parse(key);
        self.authorize(&key, Operation::Read)?;
        let entry = self.store.get(&key.encoded()).await?;
        Ok(entry.map(|entry| entry.version).unwrap_or(0))
    }

    pub async fn exists(&self, key: &str) -> MeshResult<bool> {
        let key = MeshKey::parse(key);
        self.authorize(&key, Operation::Read)?;
        Ok(self.store.get(&key.encoded()).await?.is_some())
    }

    pub async fn delete(&self, key: &str) -> MeshResult<bool> {
        self.delete_entry(MeshKey::parse(key)).await
    }

    pub async fn delete_in(&self, namespace: &str, name: &str) -> MeshResult<bool> {
        self.delete_entry(MeshKey::new(namespace, name)).await
    }

    async fn delete_entry(&self, key: MeshKey) -> MeshResult<bool> {
        self.authorize(&key, Operation::Delete)?;
        let removed = self.store.delete(&key.encoded()).await?;
        if removed {
            self.publish_event(
                key.namespace(),
                json!({
                    "event": "delete",
                    "key": key.encoded(),
                    "namespace": key.namespace(),
                }),
            )
            .await;
        }
        Ok(removed)
    }

    /// Point-in-time, best-effort multi-key read: no atomicity across
    /// keys. Each matched key is read-authorized individually and denied
    /// keys drop out (the denials are audited). Store failures abort.
    pub async fn snapshot(&self, patterns: &[&str]) -> MeshResult<BTreeMap<String, Vec<u8>>> {
        let mut compiled = Vec::with_capacity(patterns.len());
        for raw in patterns {
            let pattern = KeyPattern::parse(raw).map_err(|err| MeshError::SnapshotFailed {
                detail: err.to_string(),
            })?;
            compiled.push(pattern);
        }
        let entries = self
            .store
            .scan("")
            .await
            .map_err(|err| MeshError::SnapshotFailed {
                detail: err.to_string(),
            })?;
        let mut result = BTreeMap::new();
        for (encoded, entry) in entries {
            if !compiled.iter().any(|pattern| pattern.matches_encoded(&encoded)) {
                continue;
            }
            let key = MeshKey::parse(&encoded);
            if !self.gate.authorize(&key, Operation::Read, &self.caller) {
                continue;
            }
            if digest_of(&entry.value) != entry.digest {
                return Err(MeshError::Corruption { key: encoded });
            }
            result.insert(encoded, entry.value);
        }
        Ok(result)
    }

    /// Privileged full dump, authorized as `Admin`.
    pub async fn all(&self) -> MeshResult<BTreeMap<String, Vec<u8>>> {
        self.authorize(&MeshKey::new(ADMIN_NAMESPACE, "mesh"), Operation::Admin)?;
        let entries = self.store.scan("").await?;
        let mut result = BTreeMap::new();
        for (encoded, entry) in entries {
            if digest_of(&entry.value) != entry.digest {
                return Err(MeshError::Corruption { key: encoded });
            }
            result.insert(encoded, entry.value);
        }
        Ok(result)
    }

    /// Irreversibly removes every key, or every key of one namespace.
    /// Authorized as `Admin` against the affected scope; publishes a
    /// `clear` event per swept namespace. Returns the count removed.
    pub async fn clear(&self, namespace: Option<&str>) -> MeshResult<usize> {
        let guard = match namespace {
            Some(ns) => MeshKey::new(ns, "*"),
            None => MeshKey::new(ADMIN_NAMESPACE, "mesh"),
        };
        self.authorize(&guard, Operation::Admin)?;
        let prefix = namespace.map(|ns| format!("{ns}:")).unwrap_or_default();
        let entries = self.store.scan(&prefix).await?;
        let mut removed = 0usize;
        let mut swept: HashSet<String> = HashSet::new();
        for (encoded, _) in entries {
            if self.store.delete(&encoded).await? {
                removed += 1;
                swept.insert(MeshKey::parse(&encoded).namespace().to_string());
            }
        }
        for ns in swept {
            self.publish_event(&ns, json!({ "event": "clear", "namespace": ns.as_str() }))
                .await;
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> MeshResult<MeshStats> {
        let store = self.store.stats().await?;
        Ok(MeshStats {
            entries: store.entries,
            approx_value_bytes: store.approx_value_bytes,
            hits: store.hits,
            misses: store.misses,
            subscriptions: self.subscriptions.subscription_stats(),
        })
    }

    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> MeshResult<String> {
        self.subscriptions.subscribe(pattern, handler).await
    }

    pub async fn unsubscribe(&self, pattern: &str) -> MeshResult<bool> {
        self.subscriptions.unsubscribe(pattern).await
    }

    /// Publishes `data` on `channel`, stamped with this handle's unit as
    /// the envelope source.
    pub async fn publish(&self, channel: &str, data: Value) -> MeshResult<usize> {
        self.subscriptions
            .publish(channel, data, &self.caller.unit)
            .await
    }

    pub async fn broadcast(
        &self,
        channels: &[&str],
        data: Value,
    ) -> BTreeMap<String, BroadcastOutcome> {
        self.subscriptions
            .broadcast(channels, data, &self.caller.unit)
            .await
    }

    pub async fn cleanup_inactive(&self) -> usize {
        self.subscriptions.cleanup_inactive().await
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.subscription_count()
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.subscriptions.subscriptions()
    }

    pub fn subscription_stats(&self) -> SubscriptionStats {
        self.subscriptions.subscription_stats()
    }

    /// Best-effort change event; failures are logged, never fatal to the
    /// write that triggered them.
    async fn publish_event(&self, namespace: &str, data: Value) {
        let channel = format!("{EVENTS_CHANNEL_PREFIX}{namespace}");
        if let Err(err) = self
            .subscriptions
            .publish(&channel, data, &self.caller.unit)
            .await
        {
            tracing::debug!(channel, "change event dropped: {err}");
        }
    }
}

fn digest_of(value: &[u8]) -> String {
    hex::encode(Sha256::digest(value))
}
