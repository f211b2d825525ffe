//! Reconcile failures and the requeue decision they map to

use super::resolver::{ReferenceNotFoundError, ResolveError};
use crate::api::ApiError;
use crate::resources::Collection;
use crate::store::StoreError;
use std::time::Duration;
use thiserror::Error;

/// Requeue decision returned by every reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Run again after the delay
    Requeue(Duration),
    /// Run again only when an input changes
    AwaitChange,
}

/// Retry class of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorClass {
    /// Retries cannot help; a spec edit is required
    Validation,
    /// The API key was rejected
    Auth,
    /// Something referenced does not exist yet
    MissingReference,
    /// Network, rate limit, server error or timeout
    Transient,
}

impl ErrorClass {
    /// Ordering used to pick the error reported for a partial failure
    fn severity(&self) -> u8 {
        match self {
            ErrorClass::Validation => 3,
            ErrorClass::Auth => 2,
            ErrorClass::MissingReference => 1,
            ErrorClass::Transient => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::Auth => "auth",
            ErrorClass::MissingReference => "missing_reference",
            ErrorClass::Transient => "transient",
        }
    }

    pub fn of_api(error: &ApiError) -> Self {
        match error {
            ApiError::Auth(_) => ErrorClass::Auth,
            ApiError::NotFound(_) => ErrorClass::MissingReference,
            ApiError::Duplicate(_) | ApiError::RateLimited { .. } | ApiError::Transient(_) => {
                ErrorClass::Transient
            }
        }
    }
}

/// Pick the most severe of several API errors
pub(crate) fn most_severe<'a>(errors: impl IntoIterator<Item = &'a ApiError>) -> Option<&'a ApiError> {
    errors
        .into_iter()
        .max_by_key(|e| ErrorClass::of_api(e).severity())
}

fn join_collections(collections: &[Collection]) -> String {
    collections
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure of a single reconcile
#[derive(Debug, Clone, Error)]
pub enum ReconcileError {
    /// Malformed spec, caught before any remote call
    #[error("invalid spec: {0}")]
    Validation(String),

    #[error(transparent)]
    ReferenceNotFound(#[from] ReferenceNotFoundError),

    #[error("credentials secret {namespace}/{name} (key '{key}') not found")]
    CredentialsNotFound {
        namespace: String,
        name: String,
        key: String,
    },

    #[error("remote profile {0} not found")]
    RemoteProfileNotFound(String),

    /// A remote call outside the per-collection sync failed
    #[error("{context}: {source}")]
    Api {
        context: String,
        #[source]
        source: ApiError,
    },

    /// Some collections failed; the others were synced
    #[error("sync failed for {}: {worst}", join_collections(.failed))]
    PartialSync {
        failed: Vec<Collection>,
        worst: ApiError,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
}

impl From<ResolveError> for ReconcileError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::ReferenceNotFound(missing) => ReconcileError::ReferenceNotFound(missing),
            ResolveError::Store(store) => ReconcileError::Store(store),
        }
    }
}

impl ReconcileError {
    pub fn api(context: impl Into<String>, source: ApiError) -> Self {
        ReconcileError::Api {
            context: context.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Validation(_) => ErrorClass::Validation,
            ReconcileError::ReferenceNotFound(_)
            | ReconcileError::CredentialsNotFound { .. }
            | ReconcileError::RemoteProfileNotFound(_) => ErrorClass::MissingReference,
            ReconcileError::Api { source, .. } => ErrorClass::of_api(source),
            ReconcileError::PartialSync { worst, .. } => ErrorClass::of_api(worst),
            ReconcileError::Store(_) | ReconcileError::Timeout(_) => ErrorClass::Transient,
        }
    }

    /// Server-requested delay, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ReconcileError::Api {
                source: ApiError::RateLimited { retry_after },
                ..
            }
            | ReconcileError::PartialSync {
                worst: ApiError::RateLimited { retry_after },
                ..
            } => *retry_after,
            _ => None,
        }
    }

    /// CamelCase condition reason
    pub fn reason(&self) -> &'static str {
        match self {
            ReconcileError::Validation(_) => "InvalidSpec",
            ReconcileError::ReferenceNotFound(_) => "ReferenceNotFound",
            ReconcileError::CredentialsNotFound { .. } => "CredentialsNotFound",
            ReconcileError::RemoteProfileNotFound(_) => "RemoteProfileNotFound",
            ReconcileError::Api { source, .. } => match source {
                ApiError::Auth(_) => "AuthFailed",
                ApiError::RateLimited { .. } => "RateLimited",
                _ => "ApiError",
            },
            ReconcileError::PartialSync { worst, .. } => match worst {
                ApiError::Auth(_) => "AuthFailed",
                _ => "PartialSync",
            },
            ReconcileError::Store(_) => "StoreError",
            ReconcileError::Timeout(_) => "Timeout",
        }
    }
}
