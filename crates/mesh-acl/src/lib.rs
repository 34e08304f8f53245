//! Authorization for the semantic mesh: namespaced keys, capability
//! tokens, an ordered rule engine, a TTL'd capability ledger, and the
//! audit ring both strategies append to.
//!
//! Two interchangeable gates implement [`AccessGate`].
//! [`AccessController`] evaluates ordered pattern rules with hard-coded
//! namespace protections; [`CapabilityLedger`] checks granted permissions
//! against held capability tokens. Both record every decision and deny
//! when evaluation itself faults.

pub mod audit;
pub mod capability;
pub mod error;
pub mod gate;
pub mod key;
pub mod ledger;
pub mod pattern;
pub mod rules;
pub mod time;

pub use audit::{AuditEntry, AuditFilter, AuditLog, DEFAULT_AUDIT_CAPACITY};
pub use capability::{ADMIN_CAPABILITY, Capability, CapabilitySet};
pub use error::AclError;
pub use gate::{AccessGate, CallerContext, DefaultPolicy, Operation};
pub use key::{
    ADMIN_NAMESPACE, DEFAULT_NAMESPACE, MeshKey, PUBLIC_NAMESPACES, READ_ONLY_NAMESPACE,
};
pub use ledger::{CapabilityLedger, LedgerConfig, OpPattern, Permission};
pub use pattern::KeyPattern;
pub use rules::{AccessController, AccessRule, TimeRestrictions};
pub use time::{Clock, ManualClock, SystemClock};
