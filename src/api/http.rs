//! NextDNS REST client
//!
//! Every response body is wrapped as `{"data": ...}`. Status codes are mapped
//! onto [`ApiError`] classes here so nothing above this layer inspects HTTP.

use super::{
    ApiError, ApiResult, BlockPagePatch, BlockPageSettings, DomainList, GeneralSettings,
    GeneralSettingsPatch, LogsPatch, LogsSettings, ParentalControlPatch, ParentalControlSettings,
    PerformancePatch, PerformanceSettings, PolicyApi, PolicyApiFactory, PrivacyPatch,
    PrivacySettings, RemoteEntry, RemotePrivacy, RemoteProfile, RemoteSettings, SecurityPatch,
    SecuritySettings,
};
use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default API endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.nextdns.io";

/// Per-request timeout for reads
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-request timeout for create/update/delete operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(15);
/// TCP connect timeout
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const API_KEY_HEADER: &str = "X-Api-Key";
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdRef {
    id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ActiveRef {
    id: String,
    #[serde(default = "default_true")]
    active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CreatedProfile {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ProfileWire {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrivacyWire {
    #[serde(default)]
    blocklists: Vec<IdRef>,
    #[serde(default)]
    natives: Vec<IdRef>,
    #[serde(flatten)]
    settings: PrivacySettings,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentalWire {
    #[serde(default)]
    services: Vec<ActiveRef>,
    #[serde(default)]
    categories: Vec<ActiveRef>,
    #[serde(default)]
    safe_search: bool,
    #[serde(default)]
    youtube_restricted_mode: bool,
    #[serde(default)]
    block_bypass: bool,
}

impl From<ParentalWire> for ParentalControlSettings {
    fn from(wire: ParentalWire) -> Self {
        let active_ids = |refs: Vec<ActiveRef>| {
            let mut ids: Vec<String> = refs.into_iter().filter(|r| r.active).map(|r| r.id).collect();
            ids.sort();
            ids
        };
        Self {
            services: active_ids(wire.services),
            categories: active_ids(wire.categories),
            safe_search: wire.safe_search,
            youtube_restricted_mode: wire.youtube_restricted_mode,
            block_bypass: wire.block_bypass,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ParentalPatchWire {
    #[serde(skip_serializing_if = "Option::is_none")]
    services: Option<Vec<ActiveRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    categories: Option<Vec<ActiveRef>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safe_search: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    youtube_restricted_mode: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    block_bypass: Option<bool>,
}

impl From<&ParentalControlPatch> for ParentalPatchWire {
    fn from(patch: &ParentalControlPatch) -> Self {
        let refs = |ids: &Option<Vec<String>>| {
            ids.as_ref().map(|ids| {
                ids.iter()
                    .map(|id| ActiveRef {
                        id: id.clone(),
                        active: true,
                    })
                    .collect()
            })
        };
        Self {
            services: refs(&patch.services),
            categories: refs(&patch.categories),
            safe_search: patch.safe_search,
            youtube_restricted_mode: patch.youtube_restricted_mode,
            block_bypass: patch.block_bypass,
        }
    }
}

/// Logs settings as the API shapes them: "drop" flags and retention in seconds
#[derive(Debug, Default, Serialize, Deserialize)]
struct LogsDrop {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ip: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    domain: Option<bool>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LogsWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    drop: Option<LogsDrop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retention: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
}

impl From<LogsWire> for LogsSettings {
    fn from(wire: LogsWire) -> Self {
        let drop = wire.drop.unwrap_or_default();
        Self {
            enabled: wire.enabled.unwrap_or_default(),
            log_client_ips: !drop.ip.unwrap_or_default(),
            log_domains: !drop.domain.unwrap_or_default(),
            retention_days: (wire.retention.unwrap_or_default() / SECONDS_PER_DAY) as u32,
            location: wire.location.unwrap_or_default(),
        }
    }
}

impl From<&LogsPatch> for LogsWire {
    fn from(patch: &LogsPatch) -> Self {
        let drop = if patch.log_client_ips.is_some() || patch.log_domains.is_some() {
            Some(LogsDrop {
                ip: patch.log_client_ips.map(|log| !log),
                domain: patch.log_domains.map(|log| !log),
            })
        } else {
            None
        };
        Self {
            enabled: patch.enabled,
            drop,
            retention: patch.retention_days.map(|d| u64::from(d) * SECONDS_PER_DAY),
            location: patch.location.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsWire {
    #[serde(default)]
    logs: LogsWire,
    #[serde(default)]
    block_page: BlockPageSettings,
    #[serde(default)]
    performance: PerformanceSettings,
    #[serde(default)]
    web3: bool,
}

impl From<SettingsWire> for RemoteSettings {
    fn from(wire: SettingsWire) -> Self {
        Self {
            logs: wire.logs.into(),
            block_page: wire.block_page,
            performance: wire.performance,
            general: GeneralSettings { web3: wire.web3 },
        }
    }
}

/// Map a failed response onto an error class
fn classify(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ApiError {
    let detail = serde_json::from_str::<ErrorBody>(body).unwrap_or_default();
    let duplicate = detail
        .errors
        .iter()
        .any(|e| e.code.as_deref() == Some("duplicate"));
    let message = detail
        .errors
        .iter()
        .filter_map(|e| e.detail.clone().or_else(|| e.code.clone()))
        .collect::<Vec<_>>()
        .join("; ");
    let message = if message.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, message)
    };

    match status {
        StatusCode::NOT_FOUND => ApiError::NotFound(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Auth(message),
        StatusCode::CONFLICT => ApiError::Duplicate(message),
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited { retry_after },
        _ if duplicate => ApiError::Duplicate(message),
        _ => ApiError::Transient(message),
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Transient(format!("request timed out: {}", e))
    } else {
        ApiError::Transient(e.to_string())
    }
}

fn build_http_client() -> ApiResult<Client> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .default_headers({
            let mut headers = header::HeaderMap::new();
            headers.insert(
                header::USER_AGENT,
                header::HeaderValue::from_static(concat!("nextdns-operator/", env!("CARGO_PKG_VERSION"))),
            );
            headers.insert(
                header::ACCEPT,
                header::HeaderValue::from_static("application/json"),
            );
            headers
        })
        .build()
        .map_err(transport_error)
}

/// Policy API client for one API key
pub struct NextDnsClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl NextDnsClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> ApiResult<Self> {
        Ok(Self::with_client(build_http_client()?, base_url, api_key))
    }

    /// Reuse an existing connection pool
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(timeout)
    }

    async fn send(&self, request: RequestBuilder) -> ApiResult<Response> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        Err(classify(status, retry_after, &body))
    }

    async fn get_data<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
        debug!(path = %path, "GET");
        let response = self
            .send(self.request(Method::GET, path, READ_TIMEOUT))
            .await?;
        let envelope: Envelope<T> = response.json().await.map_err(transport_error)?;
        Ok(envelope.data)
    }

    async fn write<B: Serialize + ?Sized + Sync>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> ApiResult<Response> {
        debug!(method = %method, path = %path, "Remote mutation");
        self.send(self.request(method, path, WRITE_TIMEOUT).json(body))
            .await
    }

    fn profile_path(profile_id: &str, suffix: &str) -> String {
        format!("/profiles/{}{}", urlencoding::encode(profile_id), suffix)
    }

    fn entry_path(profile_id: &str, list: DomainList, domain: &str) -> String {
        Self::profile_path(
            profile_id,
            &format!("/{}/{}", list.path(), urlencoding::encode(domain)),
        )
    }
}

fn id_refs(ids: &[String]) -> Vec<IdRef> {
    ids.iter().map(|id| IdRef { id: id.clone() }).collect()
}

#[async_trait]
impl PolicyApi for NextDnsClient {
    async fn create_profile(&self, name: &str) -> ApiResult<String> {
        let response = self
            .write(Method::POST, "/profiles", &serde_json::json!({ "name": name }))
            .await?;
        let created: Envelope<CreatedProfile> = response.json().await.map_err(transport_error)?;
        Ok(created.data.id)
    }

    async fn get_profile(&self, profile_id: &str) -> ApiResult<RemoteProfile> {
        let profile: ProfileWire = self.get_data(&Self::profile_path(profile_id, "")).await?;
        Ok(RemoteProfile {
            id: profile_id.to_string(),
            name: profile.name,
        })
    }

    async fn update_profile(&self, profile_id: &str, name: &str) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, ""),
            &serde_json::json!({ "name": name }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_profile(&self, profile_id: &str) -> ApiResult<()> {
        debug!(profile_id = %profile_id, "Deleting remote profile");
        self.send(self.request(
            Method::DELETE,
            &Self::profile_path(profile_id, ""),
            WRITE_TIMEOUT,
        ))
        .await
        .map(|_| ())
    }

    async fn get_security(&self, profile_id: &str) -> ApiResult<SecuritySettings> {
        self.get_data(&Self::profile_path(profile_id, "/security"))
            .await
    }

    async fn update_security(&self, profile_id: &str, patch: &SecurityPatch) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/security"),
            patch,
        )
        .await
        .map(|_| ())
    }

    async fn get_security_tlds(&self, profile_id: &str) -> ApiResult<Vec<String>> {
        let tlds: Vec<IdRef> = self
            .get_data(&Self::profile_path(profile_id, "/security/tlds"))
            .await?;
        Ok(tlds.into_iter().map(|t| t.id).collect())
    }

    async fn sync_security_tlds(&self, profile_id: &str, tlds: &[String]) -> ApiResult<()> {
        self.write(
            Method::PUT,
            &Self::profile_path(profile_id, "/security/tlds"),
            &id_refs(tlds),
        )
        .await
        .map(|_| ())
    }

    async fn get_privacy(&self, profile_id: &str) -> ApiResult<RemotePrivacy> {
        let wire: PrivacyWire = self
            .get_data(&Self::profile_path(profile_id, "/privacy"))
            .await?;
        Ok(RemotePrivacy {
            settings: wire.settings,
            blocklists: wire.blocklists.into_iter().map(|b| b.id).collect(),
            natives: wire.natives.into_iter().map(|n| n.id).collect(),
        })
    }

    async fn update_privacy(&self, profile_id: &str, patch: &PrivacyPatch) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/privacy"),
            patch,
        )
        .await
        .map(|_| ())
    }

    async fn sync_privacy_blocklists(&self, profile_id: &str, ids: &[String]) -> ApiResult<()> {
        self.write(
            Method::PUT,
            &Self::profile_path(profile_id, "/privacy/blocklists"),
            &id_refs(ids),
        )
        .await
        .map(|_| ())
    }

    async fn sync_privacy_natives(&self, profile_id: &str, ids: &[String]) -> ApiResult<()> {
        self.write(
            Method::PUT,
            &Self::profile_path(profile_id, "/privacy/natives"),
            &id_refs(ids),
        )
        .await
        .map(|_| ())
    }

    async fn get_parental_control(&self, profile_id: &str) -> ApiResult<ParentalControlSettings> {
        let wire: ParentalWire = self
            .get_data(&Self::profile_path(profile_id, "/parentalControl"))
            .await?;
        Ok(wire.into())
    }

    async fn update_parental_control(
        &self,
        profile_id: &str,
        patch: &ParentalControlPatch,
    ) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/parentalControl"),
            &ParentalPatchWire::from(patch),
        )
        .await
        .map(|_| ())
    }

    async fn get_domain_list(
        &self,
        profile_id: &str,
        list: DomainList,
    ) -> ApiResult<Vec<RemoteEntry>> {
        self.get_data(&Self::profile_path(profile_id, &format!("/{}", list.path())))
            .await
    }

    async fn sync_domain_list(
        &self,
        profile_id: &str,
        list: DomainList,
        entries: &[RemoteEntry],
    ) -> ApiResult<()> {
        self.write(
            Method::PUT,
            &Self::profile_path(profile_id, &format!("/{}", list.path())),
            entries,
        )
        .await
        .map(|_| ())
    }

    async fn add_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        entry: &RemoteEntry,
    ) -> ApiResult<()> {
        self.write(
            Method::POST,
            &Self::profile_path(profile_id, &format!("/{}", list.path())),
            entry,
        )
        .await
        .map(|_| ())
    }

    async fn update_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        entry: &RemoteEntry,
    ) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::entry_path(profile_id, list, &entry.id),
            &serde_json::json!({ "active": entry.active }),
        )
        .await
        .map(|_| ())
    }

    async fn delete_domain_entry(
        &self,
        profile_id: &str,
        list: DomainList,
        domain: &str,
    ) -> ApiResult<()> {
        self.send(self.request(
            Method::DELETE,
            &Self::entry_path(profile_id, list, domain),
            WRITE_TIMEOUT,
        ))
        .await
        .map(|_| ())
    }

    async fn get_settings(&self, profile_id: &str) -> ApiResult<RemoteSettings> {
        let wire: SettingsWire = self
            .get_data(&Self::profile_path(profile_id, "/settings"))
            .await?;
        Ok(wire.into())
    }

    async fn update_settings(
        &self,
        profile_id: &str,
        patch: &GeneralSettingsPatch,
    ) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/settings"),
            patch,
        )
        .await
        .map(|_| ())
    }

    async fn update_logs_settings(&self, profile_id: &str, patch: &LogsPatch) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/settings/logs"),
            &LogsWire::from(patch),
        )
        .await
        .map(|_| ())
    }

    async fn update_block_page_settings(
        &self,
        profile_id: &str,
        patch: &BlockPagePatch,
    ) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/settings/blockPage"),
            patch,
        )
        .await
        .map(|_| ())
    }

    async fn update_performance_settings(
        &self,
        profile_id: &str,
        patch: &PerformancePatch,
    ) -> ApiResult<()> {
        self.write(
            Method::PATCH,
            &Self::profile_path(profile_id, "/settings/performance"),
            patch,
        )
        .await
        .map(|_| ())
    }
}

/// Factory sharing one connection pool across API keys
pub struct HttpClientFactory {
    client: Client,
    base_url: String,
}

impl HttpClientFactory {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        Ok(Self {
            client: build_http_client()?,
            base_url: base_url.into(),
        })
    }
}

impl PolicyApiFactory for HttpClientFactory {
    fn client(&self, api_key: &str) -> ApiResult<Arc<dyn PolicyApi>> {
        if api_key.trim().is_empty() {
            return Err(ApiError::Auth("API key is empty".to_string()));
        }
        Ok(Arc::new(NextDnsClient::with_client(
            self.client.clone(),
            self.base_url.clone(),
            api_key.trim(),
        )))
    }
}
