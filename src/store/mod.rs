//! Resource store
//!
//! The controller reads declared resources and writes their status through
//! the [`ResourceStore`] trait, and looks up API keys through
//! [`CredentialLookup`]. [`InMemoryStore`] implements both and is fed by the
//! manifest source; an optional state file keeps profile status across
//! restarts.

mod memory;
mod snapshot;

pub use memory::InMemoryStore;
pub use snapshot::StateFile;

use crate::resources::{ListKind, Profile, ResourceKey, SharedList};
use crate::retry::{RetryDecision, RetryableError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store failure modes
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The object does not exist
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },

    /// The write was based on a stale resource version
    #[error("conflict writing {kind} {key}: resource version {expected} is stale (current {actual})")]
    Conflict {
        kind: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Transient I/O failure
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(kind: impl Into<String>, key: impl ToString) -> Self {
        StoreError::NotFound {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl RetryableError for StoreError {
    fn retry_decision(&self) -> RetryDecision {
        match self {
            StoreError::Conflict { .. } => RetryDecision::Retry,
            StoreError::Unavailable(_) => RetryDecision::Retry,
            StoreError::NotFound { .. } => RetryDecision::NoRetry,
        }
    }
}

/// Change notification emitted by the store
///
/// Deleted events carry the last known object so dependents can still be
/// derived from it.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    ProfileApplied(Profile),
    ProfileDeleted(Profile),
    ListApplied(SharedList),
    ListDeleted(SharedList),
    SecretApplied(ResourceKey),
    SecretDeleted(ResourceKey),
}

/// Declared resource storage
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_profile(&self, key: &ResourceKey) -> StoreResult<Profile>;

    /// List profiles, optionally restricted to one namespace
    async fn list_profiles(&self, namespace: Option<&str>) -> StoreResult<Vec<Profile>>;

    /// Replace the status of a profile
    ///
    /// Fails with `Conflict` when `profile.metadata.resource_version` is stale.
    async fn update_profile_status(&self, profile: &Profile) -> StoreResult<Profile>;

    /// Replace the finalizers of a profile
    ///
    /// Returns `None` when the write removed the last finalizer of an object
    /// marked for deletion, which removes the object.
    async fn update_profile_finalizers(&self, profile: &Profile) -> StoreResult<Option<Profile>>;

    async fn get_list(&self, kind: ListKind, key: &ResourceKey) -> StoreResult<SharedList>;

    async fn list_lists(&self, kind: ListKind, namespace: Option<&str>)
        -> StoreResult<Vec<SharedList>>;

    /// Replace the status of a shared list
    async fn update_list_status(&self, list: &SharedList) -> StoreResult<SharedList>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Secret value lookup
#[async_trait]
pub trait CredentialLookup: Send + Sync {
    /// Fails with `NotFound` if the secret or the key is absent
    async fn get_secret_value(&self, namespace: &str, name: &str, key: &str) -> StoreResult<String>;
}
