//! Reconcile state machine
//!
//! One [`Reconciler::reconcile`] call drives one key through
//! `Pending -> Resolving -> Syncing -> Ready`, or through `Deleting` when the
//! object is marked for deletion. Every failure is handled here: the caller
//! only ever sees the requeue [`Action`], and the user only sees the status.

use super::dependents::{find_dependents, DependencyTarget};
use super::desired::DesiredState;
use super::diff::DiffMode;
use super::error::{Action, ErrorClass, ReconcileError};
use super::executor::SyncExecutor;
use super::resolver::{MergedDocument, Resolution, Resolver};
use super::status::{
    created_status, deleting_status, differs, failed_status, list_status, synced_status,
    write_list_status, write_profile_status,
};
use super::ReconcileKey;
use crate::api::{ApiError, PolicyApi, PolicyApiFactory};
use crate::metrics;
use crate::resources::validation::{check_domain, check_tld, describe};
use crate::resources::{
    validate_list, validate_profile, Collection, DeletionPolicy, ListKind, Phase, Profile,
    ResourceKey, PROFILE_FINALIZER,
};
use crate::retry::{with_retry, BackoffConfig};
use crate::store::{CredentialLookup, ResourceStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// Attempts for finalizer writes losing optimistic-concurrency races
const FINALIZER_WRITE_RETRIES: u32 = 5;

/// Tunables of the state machine
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Sync mode of the allowlist and denylist
    pub list_sync_mode: DiffMode,
    /// Transient failure backoff
    pub backoff: BackoffConfig,
    /// Backoff ceiling while a reference is missing
    pub reference_retry_max: Duration,
    /// Fixed requeue after an authentication failure
    pub auth_retry_interval: Duration,
    /// Periodic re-sync of ready profiles
    pub resync_interval: Duration,
    /// Deadline of a single reconcile
    pub reconcile_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            list_sync_mode: DiffMode::Granular,
            backoff: BackoffConfig::default(),
            reference_retry_max: Duration::from_secs(120),
            auth_retry_interval: Duration::from_secs(300),
            resync_interval: Duration::from_secs(300),
            reconcile_timeout: Duration::from_secs(60),
        }
    }
}

/// What a successful reconcile did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Every collection converged
    Synced { profile_id: String, mutations: usize },
    /// Shared list status is current
    ListObserved { active_count: usize },
    /// Remote cleanup finished and the finalizer was removed
    Deleted,
    /// The object no longer exists
    Gone,
}

/// Consecutive failure counts per key, reset on success
#[derive(Debug, Default)]
struct BackoffTracker {
    failures: Mutex<HashMap<ReconcileKey, u32>>,
}

impl BackoffTracker {
    /// Record a failure and return the zero-based attempt for the backoff curve
    fn record_failure(&self, key: &ReconcileKey) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count - 1
    }

    /// Failures recorded so far, which is the attempt of the next failure
    fn failures(&self, key: &ReconcileKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn reset(&self, key: &ReconcileKey) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Remote profiles created but not yet recorded in status
#[derive(Debug, Default, Clone)]
struct PendingIds {
    ids: Arc<Mutex<HashMap<ResourceKey, String>>>,
}

impl PendingIds {
    fn get(&self, key: &ResourceKey) -> Option<String> {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn insert(&self, key: ResourceKey, id: String) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, id);
    }

    fn remove(&self, key: &ResourceKey) {
        self.ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Check merged entries that came from shared lists
fn validate_document(document: &MergedDocument) -> Result<(), String> {
    let mut problems = Vec::new();
    for kind in ListKind::ALL {
        for entry in document.get(kind) {
            let result = match kind {
                ListKind::TldList => check_tld(&entry.identifier),
                _ => check_domain(&entry.identifier),
            };
            if let Err(message) = result {
                problems.push(format!("{}: {}", kind, message));
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems.join("; "))
    }
}

/// Create the remote profile, unless an earlier attempt already did, and record its ID
async fn create_and_record(
    store: Arc<dyn ResourceStore>,
    api: Arc<dyn PolicyApi>,
    pending: PendingIds,
    key: ResourceKey,
    name: String,
) -> Result<String, ReconcileError> {
    let id = match pending.get(&key) {
        Some(id) => {
            info!(profile = %key, profile_id = %id, "Recording previously created remote profile");
            id
        }
        None => {
            let id = api
                .create_profile(&name)
                .await
                .map_err(|e| ReconcileError::api("creating remote profile", e))?;
            info!(profile = %key, profile_id = %id, "Created remote profile");
            pending.insert(key.clone(), id.clone());
            id
        }
    };

    let written = write_profile_status(store.as_ref(), &key, |current| {
        Some(created_status(current, &id))
    })
    .await;
    match written {
        Ok(_) => {
            pending.remove(&key);
            Ok(id)
        }
        Err(e) => {
            warn!(
                profile = %key,
                profile_id = %id,
                error = %e,
                "Created remote profile but could not record its ID, retrying on the next reconcile"
            );
            Err(e.into())
        }
    }
}

/// Drives keys to their declared state
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    credentials: Arc<dyn CredentialLookup>,
    api_factory: Arc<dyn PolicyApiFactory>,
    config: ReconcilerConfig,
    backoff: BackoffTracker,
    pending_ids: PendingIds,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        credentials: Arc<dyn CredentialLookup>,
        api_factory: Arc<dyn PolicyApiFactory>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            credentials,
            api_factory,
            config,
            backoff: BackoffTracker::default(),
            pending_ids: PendingIds::default(),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Reconcile one key and decide when it runs next
    #[instrument(skip_all, fields(key = %key))]
    pub async fn reconcile(&self, key: &ReconcileKey) -> Action {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.config.reconcile_timeout, self.run(key)).await {
            Ok(result) => result,
            Err(_) => {
                let error = ReconcileError::Timeout(self.config.reconcile_timeout);
                if let ReconcileKey::Profile(profile_key) = key {
                    self.record_failure(profile_key, &error).await;
                }
                Err(error)
            }
        };
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(outcome) => {
                metrics::record_reconcile(key.kind(), "success", elapsed);
                self.backoff.reset(key);
                match outcome {
                    ReconcileOutcome::Synced { .. } => Action::Requeue(self.config.resync_interval),
                    _ => Action::AwaitChange,
                }
            }
            Err(error) => {
                metrics::record_reconcile(key.kind(), "error", elapsed);
                self.error_policy(key, &error)
            }
        }
    }

    /// Reconcile one key, returning the outcome instead of a requeue action
    pub async fn run(&self, key: &ReconcileKey) -> Result<ReconcileOutcome, ReconcileError> {
        match key {
            ReconcileKey::Profile(key) => self.reconcile_profile(key).await,
            ReconcileKey::List(kind, key) => self.reconcile_list(*kind, key).await,
        }
    }

    /// Map a failure to its requeue action
    pub fn error_policy(&self, key: &ReconcileKey, error: &ReconcileError) -> Action {
        let class = error.class();
        metrics::record_reconcile_error(class.as_str());
        let attempt = self.backoff.record_failure(key);

        let action = match class {
            ErrorClass::Validation => Action::AwaitChange,
            ErrorClass::Auth => Action::Requeue(self.config.auth_retry_interval),
            ErrorClass::MissingReference => Action::Requeue(
                self.config
                    .backoff
                    .delay_capped(attempt, self.config.reference_retry_max),
            ),
            ErrorClass::Transient => Action::Requeue(match error.retry_after() {
                Some(delay) => delay.min(self.config.backoff.ceiling()),
                None => self.config.backoff.delay(attempt),
            }),
        };

        warn!(
            key = %key,
            class = class.as_str(),
            reason = error.reason(),
            attempt = attempt + 1,
            action = ?action,
            "Reconcile failed: {}",
            error
        );
        action
    }

    async fn reconcile_profile(&self, key: &ResourceKey) -> Result<ReconcileOutcome, ReconcileError> {
        let profile = match self.store.get_profile(key).await {
            Ok(profile) => profile,
            Err(e) if e.is_not_found() => {
                debug!(profile = %key, "Profile gone");
                return Ok(ReconcileOutcome::Gone);
            }
            Err(e) => return Err(e.into()),
        };

        let result = if profile.metadata.is_deleting() {
            self.finalize(&profile).await
        } else {
            match self.ensure_finalizer(profile).await {
                Ok(Some(profile)) => self.sync(&profile).await,
                Ok(None) => Ok(ReconcileOutcome::Gone),
                Err(e) => Err(e),
            }
        };

        match result {
            Err(ReconcileError::Store(ref e)) if e.is_not_found() => Ok(ReconcileOutcome::Gone),
            Err(error) => {
                if !matches!(error, ReconcileError::PartialSync { .. }) {
                    self.record_failure(key, &error).await;
                }
                Err(error)
            }
            ok => ok,
        }
    }

    /// Add the cleanup finalizer; `None` when the profile disappeared
    async fn ensure_finalizer(&self, profile: Profile) -> Result<Option<Profile>, ReconcileError> {
        if profile.metadata.has_finalizer(PROFILE_FINALIZER) {
            return Ok(Some(profile));
        }

        let key = profile.metadata.key();
        let store = self.store.as_ref();
        let key_ref = &key;
        let updated = with_retry(
            &BackoffConfig::quick(),
            FINALIZER_WRITE_RETRIES,
            "add finalizer",
            || async move {
                let mut current = store.get_profile(key_ref).await?;
                if current.metadata.has_finalizer(PROFILE_FINALIZER) {
                    return Ok(Some(current));
                }
                current.metadata.finalizers.push(PROFILE_FINALIZER.to_string());
                store.update_profile_finalizers(&current).await
            },
        )
        .await;

        match updated {
            Ok(profile) => {
                debug!(profile = %key, "Added finalizer");
                Ok(profile)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn client_for(&self, profile: &Profile) -> Result<Arc<dyn PolicyApi>, ReconcileError> {
        let secret = &profile.spec.credentials_ref;
        let namespace = &profile.metadata.namespace;
        let api_key = self
            .credentials
            .get_secret_value(namespace, &secret.name, &secret.key)
            .await
            .map_err(|e| match e {
                StoreError::NotFound { .. } => ReconcileError::CredentialsNotFound {
                    namespace: namespace.clone(),
                    name: secret.name.clone(),
                    key: secret.key.clone(),
                },
                other => ReconcileError::Store(other),
            })?;

        self.api_factory
            .client(&api_key)
            .map_err(|e| ReconcileError::api("building API client", e))
    }

    /// Resolve, ensure the remote profile, sync every collection and write status
    async fn sync(&self, profile: &Profile) -> Result<ReconcileOutcome, ReconcileError> {
        let key = profile.metadata.key();

        validate_profile(profile).map_err(|errors| ReconcileError::Validation(describe(&errors)))?;

        debug!(profile = %key, phase = %Phase::Resolving, "Resolving references");
        let resolution = Resolver::new(self.store.as_ref()).resolve(profile).await?;
        validate_document(&resolution.document).map_err(ReconcileError::Validation)?;

        let api = self.client_for(profile).await?;
        let profile_id = self.ensure_remote_profile(profile, Arc::clone(&api)).await?;

        debug!(profile = %key, profile_id = %profile_id, phase = %Phase::Syncing, "Syncing");
        let desired = DesiredState::from_profile(profile, &resolution.document);
        let report = SyncExecutor::new(api.as_ref(), &profile_id, self.config.list_sync_mode)
            .sync_profile(&desired)
            .await;

        if let Some(first) = report.outcomes.first() {
            if first.collection == Collection::Profile {
                if let Err(ApiError::NotFound(_)) = first.result {
                    return Err(ReconcileError::RemoteProfileNotFound(profile_id));
                }
            }
        }

        let succeeded = report.succeeded();
        self.write_synced_status(profile, &profile_id, &resolution, &desired, &report, succeeded)
            .await?;

        match report.error() {
            None => {
                if profile.status.as_ref().map(|s| s.phase) != Some(Phase::Ready) {
                    info!(profile = %key, profile_id = %profile_id, phase = %Phase::Ready, "Profile ready");
                }
                Ok(ReconcileOutcome::Synced {
                    profile_id,
                    mutations: report.mutations(),
                })
            }
            Some(error) => Err(error),
        }
    }

    async fn write_synced_status(
        &self,
        profile: &Profile,
        profile_id: &str,
        resolution: &Resolution,
        desired: &DesiredState,
        report: &super::SyncReport,
        always: bool,
    ) -> Result<(), ReconcileError> {
        let now = Utc::now();
        write_profile_status(self.store.as_ref(), &profile.metadata.key(), |current| {
            let mut basis = profile.clone();
            basis.status = current.status.clone();
            let status = synced_status(&basis, profile_id, resolution, desired, report, now);
            (always || differs(current.status.as_ref(), &status)).then_some(status)
        })
        .await?;
        Ok(())
    }

    /// Adopt the declared ID, reuse the recorded one, or create a remote profile
    async fn ensure_remote_profile(
        &self,
        profile: &Profile,
        api: Arc<dyn PolicyApi>,
    ) -> Result<String, ReconcileError> {
        let key = profile.metadata.key();
        if let Some(id) = profile.spec.profile_id.as_deref().filter(|id| !id.is_empty()) {
            if profile.recorded_profile_id() != Some(id) {
                info!(profile = %key, profile_id = %id, "Adopting remote profile");
            }
            return Ok(id.to_string());
        }
        if let Some(id) = profile.recorded_profile_id() {
            return Ok(id.to_string());
        }

        // Creation and recording run in their own task so the reconcile
        // deadline cannot drop a created ID before it reaches the store.
        let task = tokio::spawn(create_and_record(
            Arc::clone(&self.store),
            api,
            self.pending_ids.clone(),
            key,
            profile.spec.name.trim().to_string(),
        ));

        task.await.map_err(|e| {
            ReconcileError::api(
                "creating remote profile",
                ApiError::Transient(format!("creation task failed: {}", e)),
            )
        })?
    }

    /// ID of the remote profile owned by `profile`, in adoption order
    fn owned_profile_id(&self, profile: &Profile) -> Option<String> {
        profile
            .spec
            .profile_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .or(profile.recorded_profile_id())
            .map(str::to_string)
            .or_else(|| self.pending_ids.get(&profile.metadata.key()))
    }

    /// Remote cleanup, then finalizer removal
    async fn finalize(&self, profile: &Profile) -> Result<ReconcileOutcome, ReconcileError> {
        let key = profile.metadata.key();
        if !profile.metadata.has_finalizer(PROFILE_FINALIZER) {
            return Ok(ReconcileOutcome::Deleted);
        }

        if profile.status.as_ref().map(|s| s.phase) != Some(Phase::Deleting) {
            info!(profile = %key, phase = %Phase::Deleting, "Deleting profile");
            let now = Utc::now();
            write_profile_status(self.store.as_ref(), &key, |current| {
                Some(deleting_status(current, now))
            })
            .await?;
        }

        let remote_id = self.owned_profile_id(profile);

        match (profile.spec.deletion_policy, remote_id.as_deref()) {
            (DeletionPolicy::Orphan, _) => {
                info!(profile = %key, "Deletion policy is Orphan, keeping remote profile");
            }
            (DeletionPolicy::Delete, None) => {
                debug!(profile = %key, "No remote profile recorded, nothing to delete");
            }
            (DeletionPolicy::Delete, Some(id)) => {
                let api = self.client_for(profile).await?;
                match api.delete_profile(id).await {
                    Ok(()) => info!(profile = %key, profile_id = %id, "Deleted remote profile"),
                    Err(e) if e.is_not_found() => {
                        debug!(profile = %key, profile_id = %id, "Remote profile already gone")
                    }
                    Err(e) => return Err(ReconcileError::api("deleting remote profile", e)),
                }
            }
        }

        self.remove_finalizer(&key).await?;
        self.pending_ids.remove(&key);
        Ok(ReconcileOutcome::Deleted)
    }

    async fn remove_finalizer(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let store = self.store.as_ref();
        let result = with_retry(
            &BackoffConfig::quick(),
            FINALIZER_WRITE_RETRIES,
            "remove finalizer",
            || async move {
                let mut current = store.get_profile(key).await?;
                if !current.metadata.has_finalizer(PROFILE_FINALIZER) {
                    return Ok(Some(current));
                }
                current.metadata.finalizers.retain(|f| f != PROFILE_FINALIZER);
                store.update_profile_finalizers(&current).await
            },
        )
        .await;

        match result {
            Ok(_) => {
                debug!(profile = %key, "Removed finalizer");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort failure status; the reconcile error is what gets reported
    ///
    /// Transient failures stay out of the status until backoff reaches its
    /// ceiling, and are written on every failure from then on.
    async fn record_failure(&self, key: &ResourceKey, error: &ReconcileError) {
        if error.class() == ErrorClass::Transient {
            let attempt = self.backoff.failures(&ReconcileKey::Profile(key.clone()));
            if !self.config.backoff.reaches_ceiling(attempt) {
                debug!(profile = %key, attempt = attempt + 1, "Transient failure, status unchanged");
                return;
            }
        }

        let now = Utc::now();
        let result = write_profile_status(self.store.as_ref(), key, |current| {
            let mut status = failed_status(current, error, now);
            if current.metadata.is_deleting() {
                status.phase = Phase::Deleting;
            }
            differs(current.status.as_ref(), &status).then_some(status)
        })
        .await;

        match result {
            Ok(profile) => {
                if let Some(status) = profile.status.as_ref() {
                    debug!(profile = %key, phase = %status.phase, reason = error.reason(), "Recorded failure");
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(profile = %key, error = %e, "Failed to write failure status"),
        }
    }

    /// Shared list status: active entries, referencing profiles and validity
    async fn reconcile_list(
        &self,
        kind: ListKind,
        key: &ResourceKey,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let list = match self.store.get_list(kind, key).await {
            Ok(list) => list,
            Err(e) if e.is_not_found() => return Ok(ReconcileOutcome::Gone),
            Err(e) => return Err(e.into()),
        };

        let dependents =
            find_dependents(self.store.as_ref(), &DependencyTarget::List(kind, key.clone())).await?;
        let invalid = validate_list(&list).err().map(|errors| describe(&errors));
        let now = Utc::now();

        let result = write_list_status(self.store.as_ref(), kind, key, |current| {
            let status = list_status(current, &dependents, invalid.clone(), now);
            (current.status.as_ref() != Some(&status)).then_some(status)
        })
        .await;

        match result {
            Ok(list) => Ok(ReconcileOutcome::ListObserved {
                active_count: list.status.map_or(0, |s| s.active_count),
            }),
            Err(e) if e.is_not_found() => Ok(ReconcileOutcome::Gone),
            Err(e) => Err(e.into()),
        }
    }
}
