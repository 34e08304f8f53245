use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::audit::{AuditEntry, AuditFilter, AuditLog};
use crate::error::AclError;
use crate::gate::{AccessGate, CallerContext, DefaultPolicy, Operation};
use crate::key::{ADMIN_NAMESPACE, MeshKey, READ_ONLY_NAMESPACE};
use crate::pattern::KeyPattern;
use crate::time::{Clock, SystemClock, unix_seconds, unix_timestamp, utc_hour, utc_weekday};

/// Declarative access rule, deserializable from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessRule {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub permissions: Vec<Operation>,
    #[serde(default)]
    pub denied_operations: Vec<Operation>,
    #[serde(default)]
    pub context_permissions: HashMap<String, Vec<Operation>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_restrictions: Option<TimeRestrictions>,
    /// Decision when the rule matches but no list above covers the
    /// operation.
    #[serde(default)]
    pub default_allow: bool,
}

impl AccessRule {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            permissions: Vec::new(),
            denied_operations: Vec::new(),
            context_permissions: HashMap::new(),
            time_restrictions: None,
            default_allow: false,
        }
    }

    pub fn allow(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.permissions.extend(operations);
        self
    }

    pub fn deny(mut self, operations: impl IntoIterator<Item = Operation>) -> Self {
        self.denied_operations.extend(operations);
        self
    }

    /// Replaces both lists with `operations` for callers running under
    /// `context`.
    pub fn context(
        mut self,
        context: impl Into<String>,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Self {
        self.context_permissions
            .insert(context.into(), operations.into_iter().collect());
        self
    }

    pub fn during(mut self, restrictions: TimeRestrictions) -> Self {
        self.time_restrictions = Some(restrictions);
        self
    }

    pub fn otherwise_allow(mut self) -> Self {
        self.default_allow = true;
        self
    }
}

/// UTC window constraints attached to a rule. Outside the window the rule
/// denies regardless of its permission lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRestrictions {
    /// Inclusive hour-of-day range; `(22, 6)` wraps past midnight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_hours: Option<(u8, u8)>,
    /// Days of week, 0 = Sunday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_days: Option<Vec<u8>>,
    /// Unix seconds before which the rule denies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<u64>,
    /// Unix seconds after which the rule denies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
}

impl TimeRestrictions {
    fn validate(&self) -> Result<(), AclError> {
        if let Some((start, end)) = self.allowed_hours {
            if start > 23 || end > 23 {
                return Err(AclError::InvalidHourRange { start, end });
            }
        }
        if let Some(days) = &self.allowed_days {
            for &day in days {
                if day > 6 {
                    return Err(AclError::InvalidDay(day));
                }
            }
        }
        Ok(())
    }

    fn allows(&self, now_secs: u64) -> bool {
        if let Some((start, end)) = self.allowed_hours {
            let hour = utc_hour(now_secs);
            let inside = if start <= end {
                hour >= start && hour <= end
            } else {
                hour >= start || hour <= end
            };
            if !inside {
                return false;
            }
        }
        if let Some(days) = &self.allowed_days {
            if !days.contains(&utc_weekday(now_secs)) {
                return false;
            }
        }
        if let Some(from) = self.valid_from {
            if now_secs < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if now_secs > until {
                return false;
            }
        }
        true
    }
}

struct CompiledRule {
    name: String,
    pattern: KeyPattern,
    permissions: Vec<Operation>,
    denied: Vec<Operation>,
    context_permissions: HashMap<String, Vec<Operation>>,
    time: Option<TimeRestrictions>,
    default_allow: bool,
}

impl CompiledRule {
    fn compile(rule: AccessRule) -> Result<Self, AclError> {
        if rule.name.trim().is_empty() {
            return Err(AclError::EmptyRuleName);
        }
        let pattern = KeyPattern::parse(&rule.pattern)?;
        if let Some(time) = &rule.time_restrictions {
            time.validate()?;
        }
        Ok(Self {
            name: rule.name,
            pattern,
            permissions: rule.permissions,
            denied: rule.denied_operations,
            context_permissions: rule.context_permissions,
            time: rule.time_restrictions,
            default_allow: rule.default_allow,
        })
    }

    fn decide(&self, operation: Operation, context: Option<&str>, now_secs: u64) -> bool {
        if let Some(time) = &self.time {
            if !time.allows(now_secs) {
                return false;
            }
        }
        if let Some(context) = context {
            if let Some(operations) = self.context_permissions.get(context) {
                return operations.contains(&operation);
            }
        }
        if self.denied.contains(&operation) {
            return false;
        }
        if self.permissions.contains(&operation) {
            return true;
        }
        self.default_allow
    }
}

/// Ordered-rule authorization: the first rule whose pattern matches the key
/// decides, namespace defaults cover keys no rule matches.
///
/// Two protections precede every rule and cannot be overridden: `admin`
/// keys never delete, `readonly` keys never write or delete.
pub struct AccessController {
    rules: RwLock<Vec<CompiledRule>>,
    default_policy: DefaultPolicy,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl AccessController {
    pub fn new(default_policy: DefaultPolicy) -> Self {
        Self::with_clock(default_policy, Arc::new(SystemClock))
    }

    pub fn with_clock(default_policy: DefaultPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            default_policy,
            audit: Arc::new(AuditLog::new()),
            clock,
        }
    }

    /// Appends a rule after validating it. Later rules only see keys no
    /// earlier rule matched.
    pub fn add_rule(&self, rule: AccessRule) -> Result<(), AclError> {
        let compiled = CompiledRule::compile(rule)?;
        let mut rules = self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if rules.iter().any(|existing| existing.name == compiled.name) {
            return Err(AclError::DuplicateRule(compiled.name));
        }
        rules.push(compiled);
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = rules.len();
        rules.retain(|rule| rule.name != name);
        rules.len() != before
    }

    pub fn rule_count(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Decides one request and appends an audit entry either way. Internal
    /// faults deny.
    pub fn check_access(&self, key: &MeshKey, operation: Operation, caller: &CallerContext) -> bool {
        let now = self.clock.now();
        let decision = self.evaluate(key, operation, caller.context.as_deref(), unix_timestamp(now));
        let (granted, rule) = match decision {
            Ok(decision) => decision,
            Err(detail) => {
                log::warn!("denying {operation} on {key}: {detail}");
                (false, "fault".to_string())
            }
        };
        self.audit.append(AuditEntry {
            timestamp: unix_seconds(now),
            key: key.encoded(),
            namespace: key.namespace().to_string(),
            operation,
            granted,
            capabilities: None,
            context: caller.context.clone(),
            rule: Some(rule),
        });
        granted
    }

    fn evaluate(
        &self,
        key: &MeshKey,
        operation: Operation,
        context: Option<&str>,
        now_secs: u64,
    ) -> Result<(bool, String), &'static str> {
        if key.namespace() == ADMIN_NAMESPACE && operation == Operation::Delete {
            return Ok((false, "protected".to_string()));
        }
        if key.namespace() == READ_ONLY_NAMESPACE
            && matches!(operation, Operation::Write | Operation::Delete)
        {
            return Ok((false, "protected".to_string()));
        }
        let rules = self.rules.read().map_err(|_| "rule table lock poisoned")?;
        let encoded = key.encoded();
        for rule in rules.iter() {
            if rule.pattern.matches_encoded(&encoded) {
                return Ok((rule.decide(operation, context, now_secs), rule.name.clone()));
            }
        }
        drop(rules);
        let granted = if key.is_public() {
            true
        } else if key.namespace() == READ_ONLY_NAMESPACE {
            operation == Operation::Read
        } else if key.namespace() == ADMIN_NAMESPACE {
            false
        } else {
            self.default_policy.allows()
        };
        Ok((granted, "default".to_string()))
    }

    pub fn audit_log(&self) -> Arc<AuditLog> {
        Arc::clone(&self.audit)
    }

    pub fn audit_trail(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        self.audit.query(filter)
    }
}

impl AccessGate for AccessController {
    fn authorize(&self, key: &MeshKey, operation: Operation, caller: &CallerContext) -> bool {
        self.check_access(key, operation, caller)
    }

    fn audit(&self) -> Arc<AuditLog> {
        self.audit_log()
    }
}
