use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Token the bypass check treats as administrative.
pub const ADMIN_CAPABILITY: &str = "admin";

/// Prefix of namespace-scoped tokens (`namespace:<ns>`).
pub const NAMESPACE_CAPABILITY_PREFIX: &str = "namespace";

/// A single capability token such as `admin`, `namespace:blog` or
/// `metrics:*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn admin() -> Self {
        Self(ADMIN_CAPABILITY.to_string())
    }

    pub fn namespace(ns: &str) -> Self {
        Self(format!("{NAMESPACE_CAPABILITY_PREFIX}:{ns}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this held token satisfies `required`. `*` satisfies every
    /// token and `prefix:*` satisfies any token under `prefix`.
    pub fn satisfies(&self, required: &Capability) -> bool {
        if self.0 == required.0 || self.0 == "*" {
            return true;
        }
        match (self.0.strip_suffix(":*"), required.0.split_once(':')) {
            (Some(prefix), Some((required_prefix, _))) => prefix == required_prefix,
            _ => false,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Capability {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// An unordered set of capability tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn of<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self(tokens.into_iter().map(Capability::new).collect())
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    /// Plain token strings, for audit entries.
    pub fn tokens(&self) -> Vec<String> {
        self.0.iter().map(|cap| cap.as_str().to_string()).collect()
    }

    /// Whether any held token satisfies `required`, honoring wildcards.
    pub fn satisfies(&self, required: &Capability) -> bool {
        self.0.iter().any(|held| held.satisfies(required))
    }

    pub fn has_admin(&self) -> bool {
        self.satisfies(&Capability::admin())
    }

    /// Wildcard-aware overlap between two sets, checked in both directions.
    pub fn intersects(&self, other: &CapabilitySet) -> bool {
        self.0.iter().any(|held| {
            other
                .0
                .iter()
                .any(|req| held.satisfies(req) || req.satisfies(held))
        })
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
