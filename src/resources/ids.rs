//! Type-safe identities for declared resources

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Namespace used when a manifest or reference omits one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Namespace-qualified identity of a stored resource
///
/// Format: `namespace/name` (e.g., "home/kids-profile")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    /// Create a new key from a namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Error returned when a `namespace/name` string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid resource key '{0}', expected 'name' or 'namespace/name'")]
pub struct ParseKeyError(String);

impl FromStr for ResourceKey {
    type Err = ParseKeyError;

    /// Parse `namespace/name`, or a bare `name` in the default namespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(name), None) if !name.is_empty() => Ok(Self::new(DEFAULT_NAMESPACE, name)),
            (Some(ns), Some(name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(ParseKeyError(s.to_string())),
        }
    }
}

/// Reference from a profile to a shared resource
///
/// Not an owned object, only a lookup key. The namespace defaults to the
/// referencing resource's own namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Create a reference in the referencing resource's namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }

    /// Create a reference into an explicit namespace
    pub fn in_namespace(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Resolve to a concrete key, defaulting the namespace to `default_namespace`
    pub fn to_key(&self, default_namespace: &str) -> ResourceKey {
        ResourceKey::new(
            self.namespace.as_deref().unwrap_or(default_namespace),
            &self.name,
        )
    }
}
