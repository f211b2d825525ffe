//! Recording in-memory policy API
//!
//! Behaves like the remote service (profiles, per-entry duplicate and
//! not-found errors) and records every call so tests can assert on the exact
//! mutations a reconcile performed. Failures can be injected per operation.
//! Also backs `run --dry-run`.

use super::{
    ApiError, ApiResult, BlockPagePatch, DomainList, GeneralSettingsPatch, LogsPatch,
    ParentalControlPatch, ParentalControlSettings, PerformancePatch, PolicyApi, PolicyApiFactory,
    PrivacyPatch, RemoteEntry, RemotePrivacy, RemoteProfile, RemoteSettings, SecurityPatch,
    SecuritySettings,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Matches any operation in [`InMemoryPolicyApi::fail_on`]
pub const ANY_OPERATION: &str = "*";

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCall {
    pub op: &'static str,
    pub profile_id: Option<String>,
    /// Entry or payload detail, for assertions
    pub detail: Option<String>,
    pub mutating: bool,
}

/// Remote state of one fake profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FakeProfile {
    pub name: String,
    pub security: SecuritySettings,
    pub tlds: Vec<String>,
    pub privacy: RemotePrivacy,
    pub parental: ParentalControlSettings,
    pub allowlist: Vec<RemoteEntry>,
    pub denylist: Vec<RemoteEntry>,
    pub settings: RemoteSettings,
}

impl FakeProfile {
    fn list_mut(&mut self, list: DomainList) -> &mut Vec<RemoteEntry> {
        match list {
            DomainList::Allowlist => &mut self.allowlist,
            DomainList::Denylist => &mut self.denylist,
        }
    }

    pub fn list(&self, list: DomainList) -> &[RemoteEntry] {
        match list {
            DomainList::Allowlist => &self.allowlist,
            DomainList::Denylist => &self.denylist,
        }
    }
}

struct InjectedFailure {
    op: String,
    error: ApiError,
    remaining: usize,
}

#[derive(Default)]
struct FakeState {
    profiles: BTreeMap<String, FakeProfile>,
    next_id: u64,
    calls: Vec<ApiCall>,
    failures: Vec<InjectedFailure>,
}

impl FakeState {
    fn take_failure(&mut self, op: &str) -> Option<ApiError> {
        let failure = self
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && (f.op == op || f.op == ANY_OPERATION))?;
        failure.remaining -= 1;
        Some(failure.error.clone())
    }

    fn profile(&self, id: &str) -> ApiResult<&FakeProfile> {
        self.profiles
            .get(id)
            .ok_or_else(|| ApiError::NotFound(format!("profile {}", id)))
    }

    fn profile_mut(&mut self, id: &str) -> ApiResult<&mut FakeProfile> {
        self.profiles
            .get_mut(id)
            .ok_or_else(|| ApiError::NotFound(format!("profile {}", id)))
    }
}

/// In-memory [`PolicyApi`] and [`PolicyApiFactory`]
///
/// Clones share state, so a test can keep a handle while the controller uses
/// the factory.
#[derive(Clone, Default)]
pub struct InMemoryPolicyApi {
    state: Arc<Mutex<FakeState>>,
}

impl InMemoryPolicyApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing remote profile
    pub async fn insert_profile(&self, id: impl Into<String>, profile: FakeProfile) {
        self.state.lock().await.profiles.insert(id.into(), profile);
    }

    /// Current remote state of a profile
    pub async fn profile(&self, id: &str) -> Option<FakeProfile> {
        self.state.lock().await.profiles.get(id).cloned()
    }

    pub async fn profile_ids(&self) -> Vec<String> {
        self.state.lock().await.profiles.keys().cloned().collect()
    }

    /// Every call since creation or the last [`clear_calls`](Self::clear_calls)
    pub async fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().await.calls.clone()
    }

    /// Only the calls that change remote state
    pub async fn mutations(&self) -> Vec<ApiCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.mutating)
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Fail the next `times` calls of `op` (or of any op with [`ANY_OPERATION`])
    pub async fn fail_on(&self, op: &str, error: ApiError, times: usize) {
        self.state.lock().await.failures.push(InjectedFailure {
            op: op.to_string(),
            error,
            remaining: times,
        });
    }

    async fn call<T, F>(
        &self,
        op: &'static str,
        profile_id: Option<&str>,
        detail: Option<String>,
        mutating: bool,
        apply: F,
    ) -> ApiResult<T>
    where
        F: FnOnce(&mut FakeState) -> ApiResult<T> + Send,
        T: Send,
    {
        let mut state = self.state.lock().await;
        state.calls.push(ApiCall {
            op,
            profile_id: profile_id.map(str::to_string),
            detail,
            mutating,
        });
        if let Some(error) = state.take_failure(op) {
            return Err(error);
        }
        apply(&mut state)
    }
}

fn sorted(mut ids: Vec<String>) -> Vec<String> {
    ids.sort();
    ids.dedup();
    ids
}

#[async_trait]
impl PolicyApi for InMemoryPolicyApi {
    async fn create_profile(&self, name: &str) -> ApiResult<String> {
        let name = name.to_string();
        self.call("create_profile", None, Some(name.clone()), true, move |state| {
            state.next_id += 1;
            let id = format!("fake{:04}", state.next_id);
            state.profiles.insert(
                id.clone(),
                FakeProfile {
                    name,
                    ..Default::default()
                },
            );
            Ok(id)
        })
        .await
    }

    async fn get_profile(&self, profile_id: &str) -> ApiResult<RemoteProfile> {
        self.call("get_profile", Some(profile_id), None, false, |state| {
            let profile = state.profile(profile_id)?;
            Ok(RemoteProfile {
                id: profile_id.to_string(),
                name: profile.name.clone(),
            })
        })
        .await
    }

    async fn update_profile(&self, profile_id: &str, name: &str) -> ApiResult<()> {
        self.call("update_profile", Some(profile_id), Some(name.to_string()), true, |state| {
            state.profile_mut(profile_id)?.name = name.to_string();
            Ok(())
        })
        .await
    }

    async fn delete_profile(&self, profile_id: &str) -> ApiResult<()> {
        self.call("delete_profile", Some(profile_id), None, true, |state| {
            state
                .profiles
                .remove(profile_id)
                .map(|_| ())
                .ok_or_else(|| ApiError::NotFound(format!("profile {}", profile_id)))
        })
        .await
    }

    async fn get_security(&self, profile_id: &str) -> ApiResult<SecuritySettings> {
        self.call("get_security", Some(profile_id), None, false, |state| {
            Ok(state.profile(profile_id)?.security.clone())
        })
        .await
    }

    async fn update_security(&self, profile_id: &str, patch: &SecurityPatch) -> ApiResult<()> {
        self.call("update_security", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.security);
            Ok(())
        })
        .await
    }

    async fn get_security_tlds(&self, profile_id: &str) -> ApiResult<Vec<String>> {
        self.call("get_security_tlds", Some(profile_id), None, false, |state| {
            Ok(state.profile(profile_id)?.tlds.clone())
        })
        .await
    }

    async fn sync_security_tlds(&self, profile_id: &str, tlds: &[String]) -> ApiResult<()> {
        let detail = tlds.join(",");
        self.call("sync_security_tlds", Some(profile_id), Some(detail), true, |state| {
            state.profile_mut(profile_id)?.tlds = tlds.to_vec();
            Ok(())
        })
        .await
    }

    async fn get_privacy(&self, profile_id: &str) -> ApiResult<RemotePrivacy> {
        self.call("get_privacy", Some(profile_id), None, false, |state| {
            Ok(state.profile(profile_id)?.privacy.clone())
        })
        .await
    }

    async fn update_privacy(&self, profile_id: &str, patch: &PrivacyPatch) -> ApiResult<()> {
        self.call("update_privacy", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.privacy.settings);
            Ok(())
        })
        .await
    }

    async fn sync_privacy_blocklists(&self, profile_id: &str, ids: &[String]) -> ApiResult<()> {
        let detail = ids.join(",");
        self.call("sync_privacy_blocklists", Some(profile_id), Some(detail), true, |state| {
            state.profile_mut(profile_id)?.privacy.blocklists = ids.to_vec();
            Ok(())
        })
        .await
    }

    async fn sync_privacy_natives(&self, profile_id: &str, ids: &[String]) -> ApiResult<()> {
        let detail = ids.join(",");
        self.call("sync_privacy_natives", Some(profile_id), Some(detail), true, |state| {
            state.profile_mut(profile_id)?.privacy.natives = ids.to_vec();
            Ok(())
        })
        .await
    }

    async fn get_parental_control(&self, profile_id: &str) -> ApiResult<ParentalControlSettings> {
        self.call("get_parental_control", Some(profile_id), None, false, |state| {
            let mut parental = state.profile(profile_id)?.parental.clone();
            parental.services = sorted(parental.services);
            parental.categories = sorted(parental.categories);
            Ok(parental)
        })
        .await
    }

    async fn update_parental_control(
        &self,
        profile_id: &str,
        patch: &ParentalControlPatch,
    ) -> ApiResult<()> {
        self.call("update_parental_control", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.parental);
            Ok(())
        })
        .await
    }

    async fn get_domain_list(
        &self,
        profile_id: &str,
        list: DomainList,
    ) -> ApiResult<Vec<RemoteEntry>> {
        self.call("get_domain_list", Some(profile_id), Some(list.path().to_string()), false, |state| {
            Ok(state.profile(profile_id)?.list(list).to_vec())
        })
        .await
    }

    async fn sync_domain_list(
        &self,
        profile_id: &str,
        list: DomainList,
        entries: &[RemoteEntry],
    ) -> ApiResult<()> {
        let detail = format!(
            "{}:{}",
            list.path(),
            entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>().join(",")
        );
        self.call("sync_domain_list", Some(profile_id), Some(detail), true, |state| {
            *state.profile_mut(profile_id)?.list_mut(list) = entries.to_vec();
            Ok(())
        })
        .await
    }

    async fn add_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        entry: &RemoteEntry,
    ) -> ApiResult<()> {
        let detail = format!("{}:{}", list.path(), entry.id);
        self.call("add_domain_entry", Some(profile_id), Some(detail), true, |state| {
            let entries = state.profile_mut(profile_id)?.list_mut(list);
            if entries.iter().any(|e| e.id.eq_ignore_ascii_case(&entry.id)) {
                return Err(ApiError::Duplicate(entry.id.clone()));
            }
            entries.push(entry.clone());
            Ok(())
        })
        .await
    }

    async fn update_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        entry: &RemoteEntry,
    ) -> ApiResult<()> {
        let detail = format!("{}:{}", list.path(), entry.id);
        self.call("update_domain_entry", Some(profile_id), Some(detail), true, |state| {
            let entries = state.profile_mut(profile_id)?.list_mut(list);
            let existing = entries
                .iter_mut()
                .find(|e| e.id.eq_ignore_ascii_case(&entry.id))
                .ok_or_else(|| ApiError::NotFound(entry.id.clone()))?;
            existing.active = entry.active;
            Ok(())
        })
        .await
    }

    async fn delete_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        domain: &str,
    ) -> ApiResult<()> {
        let detail = format!("{}:{}", list.path(), domain);
        self.call("delete_domain_entry", Some(profile_id), Some(detail), true, |state| {
            let entries = state.profile_mut(profile_id)?.list_mut(list);
            let before = entries.len();
            entries.retain(|e| !e.id.eq_ignore_ascii_case(domain));
            if entries.len() == before {
                return Err(ApiError::NotFound(domain.to_string()));
            }
            Ok(())
        })
        .await
    }

    async fn get_settings(&self, profile_id: &str) -> ApiResult<RemoteSettings> {
        self.call("get_settings", Some(profile_id), None, false, |state| {
            Ok(state.profile(profile_id)?.settings.clone())
        })
        .await
    }

    async fn update_settings(
        &self,
        profile_id: &str,
        patch: &GeneralSettingsPatch,
    ) -> ApiResult<()> {
        self.call("update_settings", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.settings.general);
            Ok(())
        })
        .await
    }

    async fn update_logs_settings(&self, profile_id: &str, patch: &LogsPatch) -> ApiResult<()> {
        self.call("update_logs_settings", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.settings.logs);
            Ok(())
        })
        .await
    }

    async fn update_block_page_settings(
        &self,
        profile_id: &str,
        patch: &BlockPagePatch,
    ) -> ApiResult<()> {
        self.call("update_block_page_settings", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.settings.block_page);
            Ok(())
        })
        .await
    }

    async fn update_performance_settings(
        &self,
        profile_id: &str,
        patch: &PerformancePatch,
    ) -> ApiResult<()> {
        self.call("update_performance_settings", Some(profile_id), None, true, |state| {
            patch.apply_to(&mut state.profile_mut(profile_id)?.settings.performance);
            Ok(())
        })
        .await
    }
}

impl PolicyApiFactory for InMemoryPolicyApi {
    fn client(&self, _api_key: &str) -> ApiResult<Arc<dyn PolicyApi>> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entry_errors_match_remote() {
        let api = InMemoryPolicyApi::new();
        let id = api.create_profile("Kids").await.unwrap();
        let entry = RemoteEntry::new("ads.example", true);

        api.add_domain_entry(&id, DomainList::Denylist, &entry).await.unwrap();
        let err = api
            .add_domain_entry(&id, DomainList::Denylist, &entry)
            .await
            .unwrap_err();
        assert!(err.is_duplicate());

        api.delete_domain_entry(&id, DomainList::Denylist, "ads.example")
            .await
            .unwrap();
        let err = api
            .delete_domain_entry(&id, DomainList::Denylist, "ads.example")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed() {
        let api = InMemoryPolicyApi::new();
        api.fail_on("create_profile", ApiError::Transient("503".into()), 1)
            .await;

        assert!(api.create_profile("Kids").await.is_err());
        assert!(api.create_profile("Kids").await.is_ok());
        assert_eq!(api.calls().await.len(), 2);
    }

    #[tokio::test]
    async fn test_records_only_mutations() {
        let api = InMemoryPolicyApi::new();
        let id = api.create_profile("Kids").await.unwrap();
        api.get_profile(&id).await.unwrap();
        api.update_profile(&id, "Kids v2").await.unwrap();

        let ops: Vec<&str> = api.mutations().await.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec!["create_profile", "update_profile"]);
        assert_eq!(api.profile(&id).await.unwrap().name, "Kids v2");
    }
}
