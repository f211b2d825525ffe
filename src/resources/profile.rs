//! Profile resource
//!
//! A profile is the primary declared object: one remote policy profile plus
//! the shared lists it references and its inline entries and feature toggles.
//! The controller mutates only its status (and its finalizer).

use super::condition::Condition;
use super::ids::ResourceRef;
use super::list::{ListEntry, ListKind};
use super::meta::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Secret key holding the API key, in the profile's namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyRef {
    pub name: String,

    #[serde(default = "default_secret_key")]
    pub key: String,
}

fn default_secret_key() -> String {
    "apiKey".to_string()
}

/// What happens to the remote profile when the profile resource is deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletionPolicy {
    /// Delete the remote profile
    #[default]
    Delete,
    /// Leave the remote profile in place
    Orphan,
}

/// Security feature toggles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    pub threat_intelligence_feeds: Option<bool>,
    pub ai_threat_detection: Option<bool>,
    pub google_safe_browsing: Option<bool>,
    pub cryptojacking: Option<bool>,
    pub dns_rebinding: Option<bool>,
    pub idn_homographs: Option<bool>,
    pub typosquatting: Option<bool>,
    pub dga: Option<bool>,
    pub nrd: Option<bool>,
    pub ddns: Option<bool>,
    pub parking: Option<bool>,
    pub csam: Option<bool>,

    /// Inline TLDs to block, merged after referenced TLD lists
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_tlds: Vec<ListEntry>,
}

/// Privacy feature toggles and blocklists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacySpec {
    /// Blocklist IDs (e.g., "nextdns-recommended", "oisd")
    #[serde(default)]
    pub blocklists: Vec<String>,

    /// Native tracking protection IDs (e.g., "apple", "windows")
    #[serde(default)]
    pub natives: Vec<String>,

    pub disguised_trackers: Option<bool>,
    pub allow_affiliate: Option<bool>,
}

/// Parental control toggles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentalControlSpec {
    /// Service IDs to block (e.g., "tiktok")
    #[serde(default)]
    pub services: Vec<String>,

    /// Category IDs to block (e.g., "gambling")
    #[serde(default)]
    pub categories: Vec<String>,

    pub safe_search: Option<bool>,
    pub youtube_restricted_mode: Option<bool>,
    pub block_bypass: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogsSpec {
    pub enabled: Option<bool>,
    pub log_client_ips: Option<bool>,
    pub log_domains: Option<bool>,
    /// Retention in days
    pub retention_days: Option<u32>,
    /// Storage location (e.g., "us", "eu", "ch")
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockPageSpec {
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSpec {
    pub ecs: Option<bool>,
    pub cache_boost: Option<bool>,
    pub cname_flattening: Option<bool>,
}

/// Profile settings, each group applied by its own remote call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSpec {
    pub logs: Option<LogsSpec>,
    pub block_page: Option<BlockPageSpec>,
    pub performance: Option<PerformanceSpec>,
    pub web3: Option<bool>,
}

/// Declared state of a profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSpec {
    /// Remote profile display name
    pub name: String,

    pub credentials_ref: SecretKeyRef,

    /// Pre-existing remote profile to adopt instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    #[serde(default)]
    pub deletion_policy: DeletionPolicy,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist_refs: Vec<ResourceRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denylist_refs: Vec<ResourceRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tld_list_refs: Vec<ResourceRef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<ListEntry>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub denylist: Vec<ListEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<SecuritySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy: Option<PrivacySpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parental_control: Option<ParentalControlSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<SettingsSpec>,
}

impl ProfileSpec {
    /// Minimal spec with a display name and credentials secret
    pub fn new(name: impl Into<String>, secret_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            credentials_ref: SecretKeyRef {
                name: secret_name.into(),
                key: default_secret_key(),
            },
            profile_id: None,
            deletion_policy: DeletionPolicy::Delete,
            allowlist_refs: Vec::new(),
            denylist_refs: Vec::new(),
            tld_list_refs: Vec::new(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            security: None,
            privacy: None,
            parental_control: None,
            settings: None,
        }
    }

    /// Declared references of one list kind
    pub fn refs(&self, kind: ListKind) -> &[ResourceRef] {
        match kind {
            ListKind::Allowlist => &self.allowlist_refs,
            ListKind::Denylist => &self.denylist_refs,
            ListKind::TldList => &self.tld_list_refs,
        }
    }

    /// Inline entries of one list kind
    pub fn inline_entries(&self, kind: ListKind) -> &[ListEntry] {
        match kind {
            ListKind::Allowlist => &self.allowlist,
            ListKind::Denylist => &self.denylist,
            ListKind::TldList => self
                .security
                .as_ref()
                .map(|s| s.blocked_tlds.as_slice())
                .unwrap_or_default(),
        }
    }
}

/// Lifecycle phase reported on the status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Resolving,
    Syncing,
    Ready,
    Error,
    Deleting,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Resolving => "Resolving",
            Phase::Syncing => "Syncing",
            Phase::Ready => "Ready",
            Phase::Error => "Error",
            Phase::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

/// Logical remote collections, synced independently of each other
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Collection {
    Profile,
    Security,
    BlockedTlds,
    Privacy,
    PrivacyBlocklists,
    PrivacyNatives,
    ParentalControl,
    Denylist,
    Allowlist,
    Settings,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Collection::Profile => "profile",
            Collection::Security => "security",
            Collection::BlockedTlds => "blockedTlds",
            Collection::Privacy => "privacy",
            Collection::PrivacyBlocklists => "privacyBlocklists",
            Collection::PrivacyNatives => "privacyNatives",
            Collection::ParentalControl => "parentalControl",
            Collection::Denylist => "denylist",
            Collection::Allowlist => "allowlist",
            Collection::Settings => "settings",
        };
        f.write_str(s)
    }
}

/// Entry counts of the collections that last synced successfully
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCounts {
    pub allowlist: usize,
    pub denylist: usize,
    pub blocked_tlds: usize,
    pub privacy_blocklists: usize,
    pub privacy_natives: usize,
    pub parental_services: usize,
    pub parental_categories: usize,
}

/// Outcome of the last sync of one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionStatus {
    pub collection: Collection,
    pub synced: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Resolution state of one declared reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceStatus {
    pub kind: ListKind,
    pub namespace: String,
    pub name: String,
    pub ready: bool,

    /// Active entries contributed by the list
    #[serde(default)]
    pub active_entries: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Observed state of a profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileStatus {
    /// Remote profile ID, recorded once on creation or adoption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,

    #[serde(default)]
    pub phase: Phase,

    #[serde(default)]
    pub counts: SyncCounts,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ReferenceStatus>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,

    /// Spec generation that produced the last successful sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A declared remote profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub metadata: ObjectMeta,
    pub spec: ProfileSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ProfileStatus>,
}

impl Profile {
    pub fn new(metadata: ObjectMeta, spec: ProfileSpec) -> Self {
        Self {
            metadata,
            spec,
            status: None,
        }
    }

    /// Remote profile ID recorded on the status, if any
    pub fn recorded_profile_id(&self) -> Option<&str> {
        self.status.as_ref().and_then(|s| s.profile_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_from_yaml() {
        let yaml = r#"
name: Kids
credentialsRef:
  name: nextdns-credentials
denylistRefs:
  - name: social
  - name: ads
    namespace: shared
denylist:
  - domain: tiktok.com
security:
  cryptojacking: true
  blockedTlds:
    - tld: zip
"#;
        let spec: ProfileSpec = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(spec.credentials_ref.key, "apiKey");
        assert_eq!(spec.deletion_policy, DeletionPolicy::Delete);
        assert_eq!(spec.refs(ListKind::Denylist).len(), 2);
        assert_eq!(spec.inline_entries(ListKind::Denylist)[0].value, "tiktok.com");
        assert_eq!(spec.inline_entries(ListKind::TldList)[0].value, "zip");
        assert!(spec.inline_entries(ListKind::Allowlist).is_empty());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = ProfileStatus {
            profile_id: Some("abc123".to_string()),
            observed_generation: Some(3),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["profileId"], "abc123");
        assert_eq!(json["observedGeneration"], 3);
        assert_eq!(json["phase"], "Pending");
    }
}
