//! Per-collection desired state
//!
//! Feature sections left out of a profile are not managed: their collections
//! are skipped and whatever the remote holds is left alone. The three list
//! kinds are always managed, so an empty merged list clears the remote one.

use super::diff::DesiredEntry;
use super::resolver::{MergedDocument, MergedEntry};
use crate::api::{
    BlockPagePatch, GeneralSettingsPatch, LogsPatch, ParentalControlPatch, PerformancePatch,
    PrivacyPatch, SecurityPatch,
};
use crate::resources::{
    BlockPageSpec, LogsSpec, ParentalControlSpec, PerformanceSpec, PrivacySpec, Profile,
    SecuritySpec, SyncCounts,
};

/// Desired settings groups; `None` groups are not managed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredSettings {
    pub logs: Option<LogsPatch>,
    pub block_page: Option<BlockPagePatch>,
    pub performance: Option<PerformancePatch>,
    pub general: GeneralSettingsPatch,
}

/// Everything one sync pass pushes to the remote profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub name: String,
    pub security: Option<SecurityPatch>,
    pub blocked_tlds: Vec<String>,
    pub privacy: Option<PrivacyPatch>,
    pub privacy_blocklists: Option<Vec<String>>,
    pub privacy_natives: Option<Vec<String>>,
    pub parental_control: Option<ParentalControlPatch>,
    pub denylist: Vec<DesiredEntry>,
    pub allowlist: Vec<DesiredEntry>,
    pub settings: Option<DesiredSettings>,
}

fn sorted_ids(ids: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = ids.iter().map(|id| id.trim().to_string()).collect();
    ids.sort();
    ids.dedup();
    ids
}

fn entries(merged: &[MergedEntry]) -> Vec<DesiredEntry> {
    merged
        .iter()
        .map(|e| DesiredEntry::new(&e.identifier, e.active))
        .collect()
}

impl From<&SecuritySpec> for SecurityPatch {
    fn from(spec: &SecuritySpec) -> Self {
        Self {
            threat_intelligence_feeds: spec.threat_intelligence_feeds,
            ai_threat_detection: spec.ai_threat_detection,
            google_safe_browsing: spec.google_safe_browsing,
            cryptojacking: spec.cryptojacking,
            dns_rebinding: spec.dns_rebinding,
            idn_homographs: spec.idn_homographs,
            typosquatting: spec.typosquatting,
            dga: spec.dga,
            nrd: spec.nrd,
            ddns: spec.ddns,
            parking: spec.parking,
            csam: spec.csam,
        }
    }
}

impl From<&PrivacySpec> for PrivacyPatch {
    fn from(spec: &PrivacySpec) -> Self {
        Self {
            disguised_trackers: spec.disguised_trackers,
            allow_affiliate: spec.allow_affiliate,
        }
    }
}

impl From<&ParentalControlSpec> for ParentalControlPatch {
    fn from(spec: &ParentalControlSpec) -> Self {
        Self {
            services: Some(sorted_ids(&spec.services)),
            categories: Some(sorted_ids(&spec.categories)),
            safe_search: spec.safe_search,
            youtube_restricted_mode: spec.youtube_restricted_mode,
            block_bypass: spec.block_bypass,
        }
    }
}

impl From<&LogsSpec> for LogsPatch {
    fn from(spec: &LogsSpec) -> Self {
        Self {
            enabled: spec.enabled,
            log_client_ips: spec.log_client_ips,
            log_domains: spec.log_domains,
            retention_days: spec.retention_days,
            location: spec.location.as_ref().map(|l| l.trim().to_lowercase()),
        }
    }
}

impl From<&BlockPageSpec> for BlockPagePatch {
    fn from(spec: &BlockPageSpec) -> Self {
        Self {
            enabled: spec.enabled,
        }
    }
}

impl From<&PerformanceSpec> for PerformancePatch {
    fn from(spec: &PerformanceSpec) -> Self {
        Self {
            ecs: spec.ecs,
            cache_boost: spec.cache_boost,
            cname_flattening: spec.cname_flattening,
        }
    }
}

impl DesiredState {
    /// Combine a profile spec with its merged document
    pub fn from_profile(profile: &Profile, document: &MergedDocument) -> Self {
        let spec = &profile.spec;

        let settings = spec.settings.as_ref().map(|s| DesiredSettings {
            logs: s.logs.as_ref().map(LogsPatch::from),
            block_page: s.block_page.as_ref().map(BlockPagePatch::from),
            performance: s.performance.as_ref().map(PerformancePatch::from),
            general: GeneralSettingsPatch { web3: s.web3 },
        });

        Self {
            name: spec.name.trim().to_string(),
            security: spec.security.as_ref().map(SecurityPatch::from),
            blocked_tlds: document.tlds.iter().map(|e| e.identifier.clone()).collect(),
            privacy: spec.privacy.as_ref().map(PrivacyPatch::from),
            privacy_blocklists: spec.privacy.as_ref().map(|p| sorted_ids(&p.blocklists)),
            privacy_natives: spec.privacy.as_ref().map(|p| sorted_ids(&p.natives)),
            parental_control: spec.parental_control.as_ref().map(ParentalControlPatch::from),
            denylist: entries(&document.denylist),
            allowlist: entries(&document.allowlist),
            settings,
        }
    }

    /// Entry counts as reported on the status when every collection syncs
    pub fn counts(&self) -> SyncCounts {
        let parental = self.parental_control.as_ref();
        SyncCounts {
            allowlist: self.allowlist.len(),
            denylist: self.denylist.len(),
            blocked_tlds: self.blocked_tlds.len(),
            privacy_blocklists: self.privacy_blocklists.as_ref().map_or(0, Vec::len),
            privacy_natives: self.privacy_natives.as_ref().map_or(0, Vec::len),
            parental_services: parental
                .and_then(|p| p.services.as_ref())
                .map_or(0, Vec::len),
            parental_categories: parental
                .and_then(|p| p.categories.as_ref())
                .map_or(0, Vec::len),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::resolver::merge_document;
    use crate::resources::{ListEntry, ObjectMeta, ProfileSpec, SettingsSpec};

    #[test]
    fn test_unset_sections_are_unmanaged() {
        let mut spec = ProfileSpec::new(" Kids ", "creds");
        spec.denylist.push(ListEntry::new("Ads.Example"));
        let profile = Profile::new(ObjectMeta::new("home", "kids"), spec);

        let desired = DesiredState::from_profile(&profile, &merge_document(&profile, &[]));

        assert_eq!(desired.name, "Kids");
        assert_eq!(desired.denylist, vec![DesiredEntry::active("ads.example")]);
        assert!(desired.security.is_none());
        assert!(desired.privacy_blocklists.is_none());
        assert!(desired.settings.is_none());
        assert!(desired.blocked_tlds.is_empty());
    }

    #[test]
    fn test_id_collections_sorted_and_counted() {
        let mut spec = ProfileSpec::new("Kids", "creds");
        spec.privacy = Some(PrivacySpec {
            blocklists: vec!["oisd".into(), "nextdns-recommended".into(), "oisd".into()],
            ..Default::default()
        });
        spec.parental_control = Some(ParentalControlSpec {
            services: vec!["tiktok".into(), "fortnite".into()],
            categories: vec!["gambling".into()],
            ..Default::default()
        });
        spec.settings = Some(SettingsSpec {
            web3: Some(true),
            ..Default::default()
        });
        let profile = Profile::new(ObjectMeta::new("home", "kids"), spec);

        let desired = DesiredState::from_profile(&profile, &MergedDocument::default());

        assert_eq!(
            desired.privacy_blocklists,
            Some(vec!["nextdns-recommended".to_string(), "oisd".to_string()])
        );
        let parental = desired.parental_control.as_ref().unwrap();
        assert_eq!(
            parental.services,
            Some(vec!["fortnite".to_string(), "tiktok".to_string()])
        );
        assert_eq!(desired.settings.as_ref().unwrap().general.web3, Some(true));

        let counts = desired.counts();
        assert_eq!(counts.privacy_blocklists, 2);
        assert_eq!(counts.parental_services, 2);
        assert_eq!(counts.parental_categories, 1);
    }
}
