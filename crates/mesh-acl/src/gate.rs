use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::capability::CapabilitySet;
use crate::key::MeshKey;

/// Operation classes an access gate decides on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Delete,
    Admin,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::Admin => "admin",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fallback decision when no rule or permission covers a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultPolicy {
    Allow,
    Deny,
}

impl DefaultPolicy {
    pub fn allows(self) -> bool {
        matches!(self, DefaultPolicy::Allow)
    }
}

/// Identity a mesh operation runs under.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub unit: String,
    pub capabilities: CapabilitySet,
    pub context: Option<String>,
}

impl CallerContext {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            capabilities: CapabilitySet::new(),
            context: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Object-safe seam both authorization strategies implement.
///
/// Implementations append an [`crate::AuditEntry`] for every decision and
/// deny when evaluation itself faults.
pub trait AccessGate: Send + Sync {
    fn authorize(&self, key: &MeshKey, operation: Operation, caller: &CallerContext) -> bool;

    /// The audit log this gate appends to.
    fn audit(&self) -> Arc<AuditLog>;
}
