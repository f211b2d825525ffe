//! Shared list resources
//!
//! Allowlists, denylists and TLD lists are reusable named collections that any
//! number of profiles may reference. Their status is a derived view written by
//! the list's own reconcile.

use super::condition::Condition;
use super::meta::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three shared list variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListKind {
    Allowlist,
    Denylist,
    TldList,
}

impl ListKind {
    pub const ALL: [ListKind; 3] = [ListKind::Allowlist, ListKind::Denylist, ListKind::TldList];

    /// Manifest `kind` value
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Allowlist => "Allowlist",
            ListKind::Denylist => "Denylist",
            ListKind::TldList => "TldList",
        }
    }

    /// Name of the profile spec field holding references of this kind
    pub fn reference_field(&self) -> &'static str {
        match self {
            ListKind::Allowlist => "allowlistRefs",
            ListKind::Denylist => "denylistRefs",
            ListKind::TldList => "tldListRefs",
        }
    }

    /// Canonical form of an identifier for comparison and deduplication
    ///
    /// Domains compare case-insensitively and ignore a trailing root dot.
    /// TLDs additionally ignore a leading dot (".io" and "io" are the same).
    pub fn normalize(&self, identifier: &str) -> String {
        let trimmed = identifier.trim().trim_end_matches('.');
        let trimmed = match self {
            ListKind::TldList => trimmed.trim_start_matches('.'),
            _ => trimmed,
        };
        trimmed.to_lowercase()
    }
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_active() -> bool {
    true
}

fn is_true(value: &bool) -> bool {
    *value
}

/// One entry of a list: a domain or TLD, an active flag and a reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    /// Domain (allow/deny lists) or TLD (TLD lists)
    #[serde(alias = "domain", alias = "tld", alias = "id")]
    pub value: String,

    #[serde(default = "default_active", skip_serializing_if = "is_true")]
    pub active: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ListEntry {
    /// Create an active entry
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            active: true,
            reason: None,
        }
    }

    /// Create an entry that is declared but switched off
    pub fn inactive(value: impl Into<String>) -> Self {
        Self {
            active: false,
            ..Self::new(value)
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Shared list spec
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedListSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub entries: Vec<ListEntry>,
}

impl SharedListSpec {
    pub fn active_entries(&self) -> impl Iterator<Item = &ListEntry> {
        self.entries.iter().filter(|e| e.active)
    }
}

/// Profile that references a shared list
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProfileReference {
    pub namespace: String,
    pub name: String,
}

/// Observed state of a shared list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedListStatus {
    pub active_count: usize,

    /// Referencing profiles, sorted by namespace then name
    #[serde(default)]
    pub profile_refs: Vec<ProfileReference>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// An allowlist, denylist or TLD list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedList {
    pub kind: ListKind,
    pub metadata: ObjectMeta,
    pub spec: SharedListSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SharedListStatus>,
}

impl SharedList {
    pub fn new(kind: ListKind, metadata: ObjectMeta, spec: SharedListSpec) -> Self {
        Self {
            kind,
            metadata,
            spec,
            status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_domains_and_tlds() {
        assert_eq!(ListKind::Denylist.normalize(" Ads.Example.COM. "), "ads.example.com");
        assert_eq!(ListKind::TldList.normalize(".ZIP"), "zip");
        assert_eq!(ListKind::Allowlist.normalize(".example.com"), ".example.com");
    }

    #[test]
    fn test_entry_aliases() {
        let domain: ListEntry = serde_yaml::from_str("domain: example.com").unwrap();
        assert_eq!(domain.value, "example.com");
        assert!(domain.active);

        let tld: ListEntry = serde_yaml::from_str("tld: zip\nactive: false\nreason: phishing").unwrap();
        assert_eq!(tld.value, "zip");
        assert!(!tld.active);
        assert_eq!(tld.reason.as_deref(), Some("phishing"));
    }
}
