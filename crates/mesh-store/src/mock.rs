//! Failure injection for tests.
//!
//! [`FlakyStore`] wraps any backend and fails the next N fallible calls with a
//! transient [`StoreError::Unavailable`], so retry and publish-failure paths
//! can be exercised deterministically.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::{
    CasOutcome, MeshStore, StoreError, StoreResult, StoreStats, StoreSubscription, StoreTopic,
    StoredEntry,
};

pub struct FlakyStore<S> {
    inner: S,
    pending_failures: AtomicU32,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending_failures: AtomicU32::new(0),
        }
    }

    /// Arm the wrapper: the next `n` store calls fail as transient.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn take_failure(&self) -> Option<StoreError> {
        let mut current = self.pending_failures.load(Ordering::SeqCst);
        while current > 0 {
            match self.pending_failures.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(StoreError::unavailable("injected failure")),
                Err(actual) => current = actual,
            }
        }
        None
    }
}

#[async_trait]
impl<S: MeshStore> MeshStore for FlakyStore<S> {
    async fn get(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, digest: String) -> StoreResult<u64> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.put(key, value, digest).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
        digest: String,
    ) -> StoreResult<CasOutcome> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.compare_and_swap(key, expected, value, digest).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.delete(key).await
    }

    async fn scan(&self, prefix: &str) -> StoreResult<Vec<(String, StoredEntry)>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.scan(prefix).await
    }

    async fn publish(&self, channel: &str, frame: &[u8]) -> StoreResult<usize> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.publish(channel, frame).await
    }

    async fn subscribe(&self, topic: StoreTopic) -> StoreResult<StoreSubscription> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.subscribe(topic).await
    }

    async fn unsubscribe(&self, id: u64) -> StoreResult<bool> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.unsubscribe(id).await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        self.inner.stats().await
    }
}
