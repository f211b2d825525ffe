//! Operator configuration file handling

use crate::api::DEFAULT_BASE_URL;
use crate::logging::LogFormat;
use crate::reconcile::{DiffMode, ReconcilerConfig};
use crate::retry::BackoffConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

fn default_workers() -> usize {
    4
}

fn default_resync_interval() -> u64 {
    300
}

fn default_reconcile_timeout() -> u64 {
    60
}

fn default_api_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_reference_retry_max() -> u64 {
    120
}

fn default_auth_retry_interval() -> u64 {
    300
}

fn default_manifest_poll_interval() -> u64 {
    10
}

/// Operator configuration
///
/// Represents the complete ~/.config/nextdns-operator/config.yaml file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Keys reconciled concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Periodic re-sync of ready profiles
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Deadline of a single reconcile
    #[serde(default = "default_reconcile_timeout")]
    pub reconcile_timeout_secs: u64,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Sync mode of the allowlist and denylist
    #[serde(default)]
    pub list_sync_mode: DiffMode,

    /// Transient failure backoff
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Backoff ceiling while a reference is missing
    #[serde(default = "default_reference_retry_max")]
    pub reference_retry_max_secs: u64,

    /// Fixed requeue after an authentication failure
    #[serde(default = "default_auth_retry_interval")]
    pub auth_retry_interval_secs: u64,

    /// Only watch this namespace; all namespaces when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default = "default_manifest_poll_interval")]
    pub manifest_poll_interval_secs: u64,

    /// Persist profile status across restarts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_file: Option<PathBuf>,

    /// Listen address of the health and metrics server, e.g. `127.0.0.1:9090`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_addr: Option<String>,

    #[serde(default)]
    pub log_format: LogFormat,
}

impl OperatorConfig {
    pub fn new() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval(),
            reconcile_timeout_secs: default_reconcile_timeout(),
            api_base_url: default_api_base_url(),
            list_sync_mode: DiffMode::default(),
            backoff: BackoffConfig::default(),
            reference_retry_max_secs: default_reference_retry_max(),
            auth_retry_interval_secs: default_auth_retry_interval(),
            namespace: None,
            manifest_poll_interval_secs: default_manifest_poll_interval(),
            state_file: None,
            metrics_addr: None,
            log_format: LogFormat::default(),
        }
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::OperatorError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading operator configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = if content.trim().is_empty() {
            Self::new()
        } else {
            serde_yaml::from_str(&content)?
        };

        tracing::debug!(
            workers = config.workers,
            list_sync_mode = %config.list_sync_mode,
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Load from `path`, or the default path, falling back to defaults when the file is absent
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::new())
        }
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving operator configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/nextdns-operator/config.yaml)
    pub fn default_path() -> PathBuf {
        // Always use ~/.config for consistency across platforms (macOS, Linux)
        let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push(".config");
        path.push("nextdns-operator");
        path.push("config.yaml");
        path
    }

    pub fn manifest_poll_interval(&self) -> Duration {
        Duration::from_secs(self.manifest_poll_interval_secs)
    }

    /// State machine tunables
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            list_sync_mode: self.list_sync_mode,
            backoff: self.backoff.clone(),
            reference_retry_max: Duration::from_secs(self.reference_retry_max_secs),
            auth_retry_interval: Duration::from_secs(self.auth_retry_interval_secs),
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
        }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_defaults() {
        let config = OperatorConfig::new();
        assert_eq!(config.workers, 4);
        assert_eq!(config.api_base_url, "https://api.nextdns.io");
        assert_eq!(config.list_sync_mode, DiffMode::Granular);
        assert_eq!(config.reference_retry_max_secs, 120);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
workers: 8
listSyncMode: replace
backoff:
  initialMs: 500
logFormat: json
"#;
        let config: OperatorConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.list_sync_mode, DiffMode::Replace);
        assert_eq!(config.backoff.initial_ms, 500);
        assert_eq!(config.backoff.max_secs, 300);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.resync_interval_secs, 300);
    }

    #[test]
    fn test_reconciler_config() {
        let config = OperatorConfig {
            auth_retry_interval_secs: 900,
            reconcile_timeout_secs: 5,
            ..OperatorConfig::new()
        };
        let reconciler = config.reconciler_config();
        assert_eq!(reconciler.auth_retry_interval, Duration::from_secs(900));
        assert_eq!(reconciler.reconcile_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let config = OperatorConfig {
            namespace: Some("home".into()),
            metrics_addr: Some("127.0.0.1:9090".into()),
            ..OperatorConfig::new()
        };
        config.save(path).unwrap();

        let loaded = OperatorConfig::load(path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(OperatorConfig::load("/nonexistent/config.yaml").is_err());
        assert_eq!(
            OperatorConfig::load_or_default(Some(Path::new("/nonexistent/config.yaml"))).unwrap(),
            OperatorConfig::new()
        );
    }

    #[test]
    fn test_default_path() {
        let path = OperatorConfig::default_path();
        assert!(path.ends_with("nextdns-operator/config.yaml"));
    }
}
