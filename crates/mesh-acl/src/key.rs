use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace a key lands in when written without an explicit prefix.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace whose keys can never be deleted through the rule engine.
pub const ADMIN_NAMESPACE: &str = "admin";

/// Namespace whose keys reject writes and deletes outright.
pub const READ_ONLY_NAMESPACE: &str = "readonly";

/// Namespaces readable by every unit regardless of held capabilities.
pub const PUBLIC_NAMESPACES: [&str; 3] = ["public", "shared", "common"];

/// A namespaced mesh key, encoded externally as `namespace:name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshKey {
    namespace: String,
    name: String,
}

impl MeshKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let namespace = if namespace.is_empty() {
            DEFAULT_NAMESPACE.to_string()
        } else {
            namespace
        };
        Self {
            namespace,
            name: name.into(),
        }
    }

    /// Splits `namespace:name` on the first colon. Input without a colon
    /// lands in the default namespace.
    pub fn parse(encoded: &str) -> Self {
        match encoded.split_once(':') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(DEFAULT_NAMESPACE, encoded),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encoded(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }

    pub fn is_public(&self) -> bool {
        PUBLIC_NAMESPACES.contains(&self.namespace.as_str())
    }
}

impl fmt::Display for MeshKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.name)
    }
}

impl From<&str> for MeshKey {
    fn from(encoded: &str) -> Self {
        Self::parse(encoded)
    }
}
