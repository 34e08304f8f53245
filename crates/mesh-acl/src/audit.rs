use std::collections::VecDeque;
use std::sync::Mutex;

use serde::Serialize;

use crate::gate::Operation;

/// Entries retained before the oldest is dropped.
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// One authorization decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Unix seconds, fractional.
    pub timestamp: f64,
    pub key: String,
    pub namespace: String,
    pub operation: Operation,
    pub granted: bool,
    /// Tokens the caller presented; `None` for gates that do not take any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Rule or stage that decided, e.g. `protected`, `default`, `fault`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,
}

/// Filter for [`AuditLog::query`]; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub key_contains: Option<String>,
    pub operation: Option<Operation>,
    pub namespace: Option<String>,
    pub granted: Option<bool>,
    pub since: Option<f64>,
    pub until: Option<f64>,
}

impl AuditFilter {
    fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(fragment) = &self.key_contains {
            if !entry.key.contains(fragment.as_str()) {
                return false;
            }
        }
        if let Some(operation) = self.operation {
            if entry.operation != operation {
                return false;
            }
        }
        if let Some(namespace) = &self.namespace {
            if entry.namespace != *namespace {
                return false;
            }
        }
        if let Some(granted) = self.granted {
            if entry.granted != granted {
                return false;
            }
        }
        if let Some(since) = self.since {
            if entry.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if entry.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Fixed-capacity ring of authorization decisions.
///
/// Appends never fail: a poisoned guard is recovered so denials stay
/// observable after a panic elsewhere in the process.
#[derive(Debug)]
pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_AUDIT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn append(&self, entry: AuditEntry) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Copies the whole ring, oldest first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.iter().cloned().collect()
    }

    /// Copies entries the filter accepts, oldest first.
    pub fn query(&self, filter: &AuditFilter) -> Vec<AuditEntry> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}
