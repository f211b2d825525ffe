//! Object metadata shared by every stored resource

use super::ids::{ResourceKey, DEFAULT_NAMESPACE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Finalizer placed on profiles so remote cleanup runs before removal
pub const PROFILE_FINALIZER: &str = "nextdns.io/profile-cleanup";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// Identity and lifecycle bookkeeping for a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Incremented by the store on every spec change
    #[serde(default)]
    pub generation: i64,

    /// Incremented by the store on every write (spec, status or finalizers)
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    /// Create metadata for a new, not yet stored, resource
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            generation: 0,
            resource_version: 0,
            deletion_timestamp: None,
            finalizers: Vec::new(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }
}
