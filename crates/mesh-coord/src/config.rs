use std::time::Duration;

use mesh_store::RetryPolicy;

/// Limits and timings for one mesh handle. Every bound is enforced before
/// the operation mutates anything.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Writes creating a key beyond this count are rejected.
    pub max_entries: usize,
    /// Framed envelopes larger than this are rejected before any store
    /// call.
    pub max_message_bytes: usize,
    /// Live subscriptions beyond this count are rejected.
    pub max_subscriptions: usize,
    /// Bounded retry of transient publish failures.
    pub publish_retry: RetryPolicy,
    /// Subscriptions idle longer than this are swept by
    /// `cleanup_inactive`.
    pub idle_timeout: Duration,
    /// A subscription whose transient handler failure lands on a nonzero
    /// multiple of this message count is deactivated.
    pub failure_check_interval: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_message_bytes: 64 * 1024,
            max_subscriptions: 1_000,
            publish_retry: RetryPolicy::default(),
            idle_timeout: Duration::from_secs(300),
            failure_check_interval: 10,
        }
    }
}
