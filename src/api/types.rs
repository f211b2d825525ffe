//! Remote policy shapes
//!
//! Each settings group is declared once with [`settings_group!`], which
//! produces the remote view (every field present) and a matching patch
//! (every field optional). A patch built from the declared spec is compared
//! field by field against the remote view, so only fields that are declared
//! and different are ever sent.

use serde::{Deserialize, Serialize};

macro_rules! settings_group {
    (
        $(#[$meta:meta])*
        $remote:ident / $patch:ident {
            $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $remote {
            $( $(#[$fmeta])* #[serde(default)] pub $field: $ty, )*
        }

        #[doc = concat!("Partial update of [`", stringify!($remote), "`]; `None` leaves a field unchanged")]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $patch {
            $(
                $(#[$fmeta])*
                #[serde(default, skip_serializing_if = "Option::is_none")]
                pub $field: Option<$ty>,
            )*
        }

        impl $patch {
            pub fn is_empty(&self) -> bool {
                true $( && self.$field.is_none() )*
            }

            /// Declared fields whose value differs from `remote`, or `None` when converged
            pub fn changes_from(&self, remote: &$remote) -> Option<Self> {
                let changes = Self {
                    $( $field: self.$field.clone().filter(|v| *v != remote.$field), )*
                };
                if changes.is_empty() {
                    None
                } else {
                    Some(changes)
                }
            }

            /// Overwrite the declared fields of `remote`
            pub fn apply_to(&self, remote: &mut $remote) {
                $(
                    if let Some(ref value) = self.$field {
                        remote.$field = value.clone();
                    }
                )*
            }
        }
    };
}

/// Remote profile identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub id: String,
    pub name: String,
}

/// One remote allowlist or denylist entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Domain
    pub id: String,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl RemoteEntry {
    pub fn new(id: impl Into<String>, active: bool) -> Self {
        Self {
            id: id.into(),
            active,
        }
    }
}

/// The two per-entry domain lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainList {
    Allowlist,
    Denylist,
}

impl DomainList {
    /// URL path segment
    pub fn path(&self) -> &'static str {
        match self {
            DomainList::Allowlist => "allowlist",
            DomainList::Denylist => "denylist",
        }
    }
}

settings_group! {
    /// Security feature flags
    SecuritySettings / SecurityPatch {
        threat_intelligence_feeds: bool,
        ai_threat_detection: bool,
        google_safe_browsing: bool,
        cryptojacking: bool,
        dns_rebinding: bool,
        idn_homographs: bool,
        typosquatting: bool,
        dga: bool,
        nrd: bool,
        ddns: bool,
        parking: bool,
        csam: bool,
    }
}

settings_group! {
    /// Privacy feature flags
    PrivacySettings / PrivacyPatch {
        disguised_trackers: bool,
        allow_affiliate: bool,
    }
}

settings_group! {
    /// Parental control flags and blocked IDs
    ///
    /// Service and category IDs are kept sorted so comparison ignores order.
    ParentalControlSettings / ParentalControlPatch {
        services: Vec<String>,
        categories: Vec<String>,
        safe_search: bool,
        youtube_restricted_mode: bool,
        block_bypass: bool,
    }
}

settings_group! {
    /// Query log settings
    LogsSettings / LogsPatch {
        enabled: bool,
        log_client_ips: bool,
        log_domains: bool,
        retention_days: u32,
        location: String,
    }
}

settings_group! {
    BlockPageSettings / BlockPagePatch {
        enabled: bool,
    }
}

settings_group! {
    PerformanceSettings / PerformancePatch {
        ecs: bool,
        cache_boost: bool,
        cname_flattening: bool,
    }
}

settings_group! {
    /// Settings that live directly on the settings object
    GeneralSettings / GeneralSettingsPatch {
        web3: bool,
    }
}

/// Privacy state: flags plus the two ID collections
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePrivacy {
    pub settings: PrivacySettings,
    pub blocklists: Vec<String>,
    pub natives: Vec<String>,
}

/// Every settings group of a profile
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSettings {
    pub logs: LogsSettings,
    pub block_page: BlockPageSettings,
    pub performance: PerformanceSettings,
    pub general: GeneralSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changes_only_declared_and_different() {
        let remote = SecuritySettings {
            cryptojacking: true,
            nrd: false,
            ..Default::default()
        };
        let desired = SecurityPatch {
            cryptojacking: Some(true),
            nrd: Some(true),
            ..Default::default()
        };

        let changes = desired.changes_from(&remote).unwrap();
        assert_eq!(changes.cryptojacking, None);
        assert_eq!(changes.nrd, Some(true));
        assert_eq!(changes.dga, None);
    }

    #[test]
    fn test_converged_patch_is_none() {
        let mut remote = LogsSettings::default();
        let desired = LogsPatch {
            enabled: Some(true),
            retention_days: Some(30),
            location: Some("eu".to_string()),
            ..Default::default()
        };

        desired.apply_to(&mut remote);
        assert!(remote.enabled);
        assert_eq!(remote.location, "eu");
        assert!(desired.changes_from(&remote).is_none());
    }

    #[test]
    fn test_patch_skips_unset_fields() {
        let patch = PerformancePatch {
            cache_boost: Some(true),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "cacheBoost": true }));
    }
}
