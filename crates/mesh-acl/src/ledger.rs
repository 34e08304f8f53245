use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::capability::{Capability, CapabilitySet};
use crate::error::AclError;
use crate::gate::{AccessGate, CallerContext, DefaultPolicy, Operation};
use crate::key::{MeshKey, PUBLIC_NAMESPACES};
use crate::pattern::KeyPattern;
use crate::time::{Clock, SystemClock, unix_seconds};

/// Which operations a permission covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpPattern {
    Any,
    One(Operation),
}

impl OpPattern {
    fn covers(self, operation: Operation) -> bool {
        match self {
            OpPattern::Any => true,
            OpPattern::One(covered) => covered == operation,
        }
    }
}

impl From<Operation> for OpPattern {
    fn from(operation: Operation) -> Self {
        OpPattern::One(operation)
    }
}

/// A granted permission: keys matching `pattern` may be used for the
/// covered operations by callers whose tokens overlap `capabilities`.
/// An empty capability set makes the grant unconditional.
#[derive(Debug, Clone)]
pub struct Permission {
    pattern: KeyPattern,
    operation: OpPattern,
    capabilities: CapabilitySet,
    granted_at: SystemTime,
    ttl: Option<Duration>,
}

impl Permission {
    fn expired_at(&self, now: SystemTime) -> bool {
        match self.ttl {
            Some(ttl) => now
                .duration_since(self.granted_at)
                .map(|age| age > ttl)
                .unwrap_or(false),
            None => false,
        }
    }

    pub fn pattern(&self) -> &KeyPattern {
        &self.pattern
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

/// Tunables for [`CapabilityLedger`].
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Callers holding the `admin` capability skip every other check.
    pub admin_bypass: bool,
    /// Require `namespace:<ns>` (or a public namespace) before the
    /// permission lookup runs.
    pub namespace_isolation: bool,
    /// Decision when no unexpired permission covers the request.
    pub default_policy: DefaultPolicy,
    /// Seed read grants for the public namespaces and a full grant
    /// unlocked by the `admin` token.
    pub bootstrap_grants: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            admin_bypass: true,
            namespace_isolation: true,
            default_policy: DefaultPolicy::Deny,
            bootstrap_grants: true,
        }
    }
}

type PermissionKey = (String, OpPattern);

/// Capability-ledger authorization: grants keyed by `(pattern, operation)`
/// with optional TTLs, unlocked by capability overlap.
pub struct CapabilityLedger {
    permissions: RwLock<HashMap<PermissionKey, Permission>>,
    config: LedgerConfig,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl CapabilityLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: LedgerConfig, clock: Arc<dyn Clock>) -> Self {
        let ledger = Self {
            permissions: RwLock::new(HashMap::new()),
            config,
            audit: Arc::new(AuditLog::new()),
            clock,
        };
        if ledger.config.bootstrap_grants {
            ledger.seed_bootstrap_grants();
        }
        ledger
    }

    // static patterns, parse cannot fail
    fn seed_bootstrap_grants(&self) {
        for ns in PUBLIC_NAMESPACES {
            let _ = self.grant_permission(
                &format!("{ns}:*"),
                Operation::Read.into(),
                CapabilitySet::new(),
                None,
            );
        }
        let _ = self.grant_permission("*", OpPattern::Any, CapabilitySet::of(["admin"]), None);
    }

    /// Grants or replaces the permission for `(pattern, operation)`.
    pub fn grant_permission(
        &self,
        pattern: &str,
        operation: OpPattern,
        capabilities: CapabilitySet,
        ttl: Option<Duration>,
    ) -> Result<(), AclError> {
        let compiled = KeyPattern::parse(pattern)?;
        let permission = Permission {
            pattern: compiled,
            operation,
            capabilities,
            granted_at: self.clock.now(),
            ttl,
        };
        let mut permissions = self
            .permissions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        permissions.insert((pattern.to_string(), operation), permission);
        Ok(())
    }

    /// Removes a grant; absent grants are a no-op.
    pub fn revoke_permission(&self, pattern: &str, operation: OpPattern) -> bool {
        let mut permissions = self
            .permissions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        permissions.remove(&(pattern.to_string(), operation)).is_some()
    }

    /// Drops every expired grant, returning how many went away.
    pub fn clear_expired_permissions(&self) -> usize {
        let now = self.clock.now();
        let mut permissions = self
            .permissions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = permissions.len();
        permissions.retain(|_, permission| !permission.expired_at(now));
        before - permissions.len()
    }

    pub fn permission_count(&self) -> usize {
        self.permissions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Decides `operation` on `key` for a caller holding `capabilities`,
    /// appending an audit entry either way. Internal faults deny.
    pub fn validate_access(
        &self,
        key: &MeshKey,
        operation: Operation,
        capabilities: &CapabilitySet,
    ) -> bool {
        self.validate_with_context(key, operation, capabilities, None)
    }

    fn validate_with_context(
        &self,
        key: &MeshKey,
        operation: Operation,
        capabilities: &CapabilitySet,
        context: Option<&str>,
    ) -> bool {
        let now = self.clock.now();
        let (granted, via) = match self.evaluate(key, operation, capabilities, now) {
            Ok(decision) => decision,
            Err(detail) => {
                log::warn!("denying {operation} on {key}: {detail}");
                (false, "fault")
            }
        };
        self.audit.append(AuditEntry {
            timestamp: unix_seconds(now),
            key: key.encoded(),
            namespace: key.namespace().to_string(),
            operation,
            granted,
            capabilities: Some(capabilities.tokens()),
            context: context.map(str::to_string),
            rule: Some(via.to_string()),
        });
        granted
    }

    fn evaluate(
        &self,
        key: &MeshKey,
        operation: Operation,
        capabilities: &CapabilitySet,
        now: SystemTime,
    ) -> Result<(bool, &'static str), &'static str> {
        if self.config.admin_bypass && capabilities.has_admin() {
            return Ok((true, "admin-bypass"));
        }
        if self.config.namespace_isolation && !key.is_public() {
            let required = Capability::namespace(key.namespace());
            if !capabilities.satisfies(&required) {
                return Ok((false, "namespace-isolation"));
            }
        }
        // the lookup takes the write half so expired grants evict in place
        let mut permissions = self
            .permissions
            .write()
            .map_err(|_| "permission table lock poisoned")?;
        let encoded = key.encoded();
        let mut expired: Vec<PermissionKey> = Vec::new();
        let mut granted = false;
        for (entry_key, permission) in permissions.iter() {
            if permission.expired_at(now) {
                expired.push(entry_key.clone());
                continue;
            }
            if !permission.operation.covers(operation)
                || !permission.pattern.matches_encoded(&encoded)
            {
                continue;
            }
            if permission.capabilities.is_empty()
                || permission.capabilities.intersects(capabilities)
            {
                granted = true;
            }
        }
        for entry_key in &expired {
            permissions.remove(entry_key);
        }
        if granted {
            Ok((true, "permission"))
        } else {
            Ok((self.config.default_policy.allows(), "default"))
        }
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    pub fn audit_trail(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit.query(filter)
    }
}

impl AccessGate for CapabilityLedger {
    fn authorize(&self, key: &MeshKey, operation: Operation, caller: &CallerContext) -> bool {
        self.validate_with_context(
            key,
            operation,
            &caller.capabilities,
            caller.context.as_deref(),
        )
    }

    fn audit(&self) -> Arc<AuditLog> {
        self.audit_log()
    }
}
