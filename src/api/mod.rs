//! Remote policy API
//!
//! The reconcile engine talks to the remote service only through
//! [`PolicyApi`], one method per remote sub-resource. [`PolicyApiFactory`]
//! builds a client per API key since every profile carries its own
//! credentials.
//!
//! - [`http::NextDnsClient`]: the REST client
//! - [`memory::InMemoryPolicyApi`]: a recording fake for tests and dry runs

mod error;
pub mod http;
pub mod memory;
mod types;

pub use error::{ApiError, ApiResult};
pub use http::{HttpClientFactory, NextDnsClient, DEFAULT_BASE_URL};
pub use memory::{ApiCall, FakeProfile, InMemoryPolicyApi, ANY_OPERATION};
pub use types::{
    BlockPagePatch, BlockPageSettings, DomainList, GeneralSettings, GeneralSettingsPatch,
    LogsPatch, LogsSettings, ParentalControlPatch, ParentalControlSettings, PerformancePatch,
    PerformanceSettings, PrivacyPatch, PrivacySettings, RemoteEntry, RemotePrivacy, RemoteProfile,
    RemoteSettings, SecurityPatch, SecuritySettings,
};

use async_trait::async_trait;
use std::sync::Arc;

/// Per-sub-resource remote policy contract
///
/// `sync_*` methods replace a whole collection; `add_`/`update_`/`delete_`
/// methods touch one domain list entry.
#[async_trait]
pub trait PolicyApi: Send + Sync {
    /// Create a profile and return its ID
    async fn create_profile(&self, name: &str) -> ApiResult<String>;
    async fn get_profile(&self, profile_id: &str) -> ApiResult<RemoteProfile>;
    async fn update_profile(&self, profile_id: &str, name: &str) -> ApiResult<()>;
    async fn delete_profile(&self, profile_id: &str) -> ApiResult<()>;

    async fn get_security(&self, profile_id: &str) -> ApiResult<SecuritySettings>;
    async fn update_security(&self, profile_id: &str, patch: &SecurityPatch) -> ApiResult<()>;
    async fn get_security_tlds(&self, profile_id: &str) -> ApiResult<Vec<String>>;
    async fn sync_security_tlds(&self, profile_id: &str, tlds: &[String]) -> ApiResult<()>;

    async fn get_privacy(&self, profile_id: &str) -> ApiResult<RemotePrivacy>;
    async fn update_privacy(&self, profile_id: &str, patch: &PrivacyPatch) -> ApiResult<()>;
    async fn sync_privacy_blocklists(&self, profile_id: &str, ids: &[String]) -> ApiResult<()>;
    async fn sync_privacy_natives(&self, profile_id: &str, ids: &[String]) -> ApiResult<()>;

    async fn get_parental_control(&self, profile_id: &str) -> ApiResult<ParentalControlSettings>;
    async fn update_parental_control(
        &self,
        profile_id: &str,
        patch: &ParentalControlPatch,
    ) -> ApiResult<()>;

    async fn get_domain_list(&self, profile_id: &str, list: DomainList)
        -> ApiResult<Vec<RemoteEntry>>;
    async fn sync_domain_list(
        &self,
        profile_id: &str,
        list: DomainList,
        entries: &[RemoteEntry],
    ) -> ApiResult<()>;
    /// Fails with `Duplicate` if the domain is already present
    async fn add_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        entry: &RemoteEntry,
    ) -> ApiResult<()>;
    /// Change the active flag of an existing entry
    async fn update_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        entry: &RemoteEntry,
    ) -> ApiResult<()>;
    async fn delete_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        domain: &str,
    ) -> ApiResult<()>;

    async fn get_settings(&self, profile_id: &str) -> ApiResult<RemoteSettings>;
    async fn update_settings(&self, profile_id: &str, patch: &GeneralSettingsPatch)
        -> ApiResult<()>;
    async fn update_logs_settings(&self, profile_id: &str, patch: &LogsPatch) -> ApiResult<()>;
    async fn update_block_page_settings(
        &self,
        profile_id: &str,
        patch: &BlockPagePatch,
    ) -> ApiResult<()>;
    async fn update_performance_settings(
        &self,
        profile_id: &str,
        patch: &PerformancePatch,
    ) -> ApiResult<()>;
}

/// Builds a policy client for one API key
pub trait PolicyApiFactory: Send + Sync {
    fn client(&self, api_key: &str) -> ApiResult<Arc<dyn PolicyApi>>;
}
