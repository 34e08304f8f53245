use std::fmt;

use mesh_acl::Operation;
use mesh_store::StoreError;
use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

/// Which configured limit a request ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    Entries,
    MessageBytes,
    Subscriptions,
}

impl fmt::Display for CapacityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CapacityKind::Entries => "entries",
            CapacityKind::MessageBytes => "message bytes",
            CapacityKind::Subscriptions => "subscriptions",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum MeshError {
    /// The gate refused; the denial is already audited.
    #[error("access denied: {operation} on {key}")]
    AccessDenied { key: String, operation: Operation },
    #[error("capacity exceeded: {kind} limit of {limit} reached")]
    CapacityExceeded { kind: CapacityKind, limit: usize },
    #[error("snapshot failed: {detail}")]
    SnapshotFailed { detail: String },
    #[error("subscription '{pattern}' failed: {detail}")]
    SubscriptionFailed { pattern: String, detail: String },
    #[error("publish to '{channel}' failed: {detail}")]
    PublishFailed { channel: String, detail: String },
    #[error("stored value for '{key}' does not match its digest")]
    Corruption { key: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MeshError {
    pub fn is_access_denied(&self) -> bool {
        matches!(self, MeshError::AccessDenied { .. })
    }

    pub fn is_capacity(&self, kind: CapacityKind) -> bool {
        matches!(self, MeshError::CapacityExceeded { kind: hit, .. } if *hit == kind)
    }
}
