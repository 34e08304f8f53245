//! Coordination facade: namespaced shared state plus pub/sub for swarm workers.
//!
//! [`SemanticMesh`] fronts a pluggable [`mesh_store::MeshStore`] with
//! gate-checked access, store-owned versioning, digest-verified reads and
//! pattern-addressed subscriptions. Access decisions come from a
//! `mesh_acl` gate; the canonical wiring is the capability ledger, with the
//! rule engine selected through [`SemanticMesh::with_gate`].

pub mod config;
pub mod envelope;
pub mod error;
pub mod mesh;
pub mod subscription;

pub use config::MeshConfig;
pub use envelope::{ENVELOPE_VERSION, MessageEnvelope};
pub use error::{CapacityKind, MeshError, MeshResult};
pub use mesh::{EVENTS_CHANNEL_PREFIX, MeshStats, SemanticMesh};
pub use subscription::{
    BroadcastOutcome, Delivery, HandlerError, MessageHandler, SubscriptionInfo,
    SubscriptionManager, SubscriptionStats,
};
