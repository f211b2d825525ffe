//! Error types for nextdns-operator
//!
//! Crate-wide error enum for setup and I/O paths (configuration, manifests,
//! state file, server). Reconcile failures have their own classified type in
//! [`crate::reconcile::ReconcileError`] and never surface here.

use crate::api::ApiError;
use crate::store::StoreError;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Error type for operator setup and I/O
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Manifest loading errors
    #[error("Manifest error in {path}: {message}")]
    Manifest { path: String, message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP client construction errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid glob pattern
    #[error("Pattern error: {0}")]
    Pattern(#[from] glob::PatternError),

    /// Unreadable glob match
    #[error("Glob error: {0}")]
    Glob(#[from] glob::GlobError),

    /// Resource store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Policy API errors
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Other errors
    #[error("{0}")]
    Other(String),

    /// Anyhow errors (for more context)
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl OperatorError {
    pub fn manifest(path: impl ToString, message: impl Into<String>) -> Self {
        OperatorError::Manifest {
            path: path.to_string(),
            message: message.into(),
        }
    }
}
