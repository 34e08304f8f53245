//! Shared test helpers for integration tests.
//!
//! Builders for in-memory meshes, caller contexts, recording handlers and a
//! fault-injecting store wrapper used across multiple integration test files.
//! Note: each integration test compiles this module separately, so some items
//! may appear unused in certain test contexts but are used by others.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use mesh_acl::{CallerContext, CapabilitySet};
use mesh_coord::subscription::{Delivery, HandlerError, MessageHandler};
use mesh_coord::{MeshConfig, SemanticMesh};
use mesh_store::{
    CasOutcome, MemStore, MeshStore, StoreError, StoreResult, StoreStats, StoreSubscription,
    StoreTopic, StoredEntry,
};
use tokio::sync::{Barrier, mpsc};

pub fn admin_caller(unit: &str) -> CallerContext {
    CallerContext::new(unit).with_capabilities(CapabilitySet::of(["admin"]))
}

/// Mesh over a fresh in-memory store whose caller passes every gate check
/// via the admin bypass.
pub fn admin_mesh() -> SemanticMesh<MemStore> {
    admin_mesh_on(Arc::new(MemStore::new()))
}

pub fn admin_mesh_on(store: Arc<MemStore>) -> SemanticMesh<MemStore> {
    SemanticMesh::new(store, admin_caller("test-admin"))
}

pub fn small_config(max_subscriptions: usize) -> MeshConfig {
    MeshConfig {
        max_subscriptions,
        ..Default::default()
    }
}

/// Forwards every delivery into an unbounded channel for the test to await.
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl RecordingHandler {
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: Delivery) -> Result<(), HandlerError> {
        let _ = self.tx.send(delivery);
        Ok(())
    }
}

/// Fails every delivery with a fixed error kind while counting attempts.
pub struct FailingHandler {
    fatal: bool,
    attempts: AtomicU64,
}

impl FailingHandler {
    pub fn fatal() -> Arc<Self> {
        Arc::new(Self {
            fatal: true,
            attempts: AtomicU64::new(0),
        })
    }

    pub fn transient() -> Arc<Self> {
        Arc::new(Self {
            fatal: false,
            attempts: AtomicU64::new(0),
        })
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, _delivery: Delivery) -> Result<(), HandlerError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            Err(HandlerError::fatal("handler rejected payload"))
        } else {
            Err(HandlerError::transient("handler busy"))
        }
    }
}

/// Store wrapper whose `publish` fails for one poisoned channel, for
/// exercising partial broadcast failures. Unlike `mesh_store::FlakyStore`
/// the failure never burns down, so every retry attempt fails too.
pub struct PoisonedChannelStore {
    inner: MemStore,
    poisoned: String,
}

impl PoisonedChannelStore {
    pub fn poisoning(channel: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemStore::new(),
            poisoned: channel.to_string(),
        })
    }
}

#[async_trait]
impl MeshStore for PoisonedChannelStore {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, digest: String) -> StoreResult<u64> {
        self.inner.put(key, value, digest).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        digest: String,
    ) -> StoreResult<CasOutcome> {
        self.inner.compare_and_swap(key, expected, value, digest).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>> {
        self.inner.scan(prefix).await
    }

    async fn publish(&self, channel: &str, frame: &[u8]) -> StoreResult<usize> {
        if channel == self.poisoned {
            return Err(StoreError::unavailable("poisoned channel"));
        }
        self.inner.publish(channel, frame).await
    }

    async fn subscribe(&self, topic: StoreTopic) -> StoreResult<StoreSubscription> {
        self.inner.subscribe(topic).await
    }

    async fn unsubscribe(&self, id: u64) -> StoreResult<bool> {
        self.inner.unsubscribe(id).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}

/// Store wrapper that parks every `subscribe` call at a shared rendezvous
/// until `parties` of them have arrived, so racing registrations pass their
/// pre-checks together.
pub struct RendezvousStore {
    inner: MemStore,
    barrier: Barrier,
}

impl RendezvousStore {
    pub fn holding(parties: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: MemStore::new(),
            barrier: Barrier::new(parties),
        })
    }
}

#[async_trait]
impl MeshStore for RendezvousStore {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, digest: String) -> StoreResult<u64> {
        self.inner.put(key, value, digest).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        digest: String,
    ) -> StoreResult<CasOutcome> {
        self.inner.compare_and_swap(key, expected, value, digest).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>> {
        self.inner.scan(prefix).await
    }

    async fn publish(&self, channel: &str, frame: &[u8]) -> StoreResult<usize> {
        self.inner.publish(channel, frame).await
    }

    async fn subscribe(&self, topic: StoreTopic) -> StoreResult<StoreSubscription> {
        self.barrier.wait().await;
        self.inner.subscribe(topic).await
    }

    async fn unsubscribe(&self, id: u64) -> StoreResult<bool> {
        self.inner.unsubscribe(id).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}
