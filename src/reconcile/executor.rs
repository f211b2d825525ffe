//! Sync execution
//!
//! Drives one remote profile to its desired state, one collection at a time.
//! Every collection is attempted even when an earlier one failed, and within
//! the settings collection each group is applied independently. Entry
//! mutations are idempotent: an add that reports Duplicate becomes an update
//! of the active flag and a remove that reports NotFound counts as done.

use super::diff::{diff, diff_ids, DesiredEntry, DiffMode, Operation};
use super::desired::{DesiredSettings, DesiredState};
use super::error::{most_severe, ReconcileError};
use crate::api::{ApiError, ApiResult, DomainList, PolicyApi, RemoteEntry};
use crate::metrics;
use crate::resources::Collection;
use tracing::{debug, info, warn};

/// Result of syncing one collection: mutation count or the failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionOutcome {
    pub collection: Collection,
    pub result: Result<usize, ApiError>,
}

impl CollectionOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of every collection attempted in one pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub outcomes: Vec<CollectionOutcome>,
}

impl SyncReport {
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(CollectionOutcome::is_ok)
    }

    pub fn failed(&self) -> Vec<Collection> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_ok())
            .map(|o| o.collection)
            .collect()
    }

    /// Whether `collection` was attempted and succeeded
    pub fn synced(&self, collection: Collection) -> bool {
        self.outcomes
            .iter()
            .any(|o| o.collection == collection && o.is_ok())
    }

    pub fn mutations(&self) -> usize {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum()
    }

    /// The partial-failure error, or `None` when everything synced
    pub fn error(&self) -> Option<ReconcileError> {
        let worst = most_severe(self.outcomes.iter().filter_map(|o| o.result.as_ref().err()))?;
        Some(ReconcileError::PartialSync {
            failed: self.failed(),
            worst: worst.clone(),
        })
    }
}

fn domain_list(collection: Collection) -> Option<DomainList> {
    match collection {
        Collection::Allowlist => Some(DomainList::Allowlist),
        Collection::Denylist => Some(DomainList::Denylist),
        _ => None,
    }
}

fn ids(entries: &[DesiredEntry]) -> Vec<String> {
    entries.iter().map(|e| e.identifier.clone()).collect()
}

/// Applies operations to one remote profile
pub struct SyncExecutor<'a> {
    api: &'a dyn PolicyApi,
    profile_id: &'a str,
    list_mode: DiffMode,
}

impl<'a> SyncExecutor<'a> {
    /// `list_mode` applies to the allowlist and denylist; the other entry
    /// collections only support replacement
    pub fn new(api: &'a dyn PolicyApi, profile_id: &'a str, list_mode: DiffMode) -> Self {
        Self {
            api,
            profile_id,
            list_mode,
        }
    }

    pub fn profile_id(&self) -> &str {
        self.profile_id
    }

    /// Apply `ops` to `collection` in order, returning the mutation count
    ///
    /// Stops at the first failing operation.
    pub async fn apply(&self, collection: Collection, ops: &[Operation]) -> ApiResult<usize> {
        let mut mutations = 0;
        for op in ops {
            debug!(collection = %collection, op = ?op, "Applying operation");
            match domain_list(collection) {
                Some(list) => self.apply_domain_op(list, op).await?,
                None => self.apply_id_op(collection, op).await?,
            }
            mutations += 1;
        }
        Ok(mutations)
    }

    async fn apply_domain_op(&self, list: DomainList, op: &Operation) -> ApiResult<()> {
        match op {
            Operation::Add { identifier, active } => {
                let entry = RemoteEntry::new(identifier, *active);
                match self.api.add_domain_entry(self.profile_id, list, &entry).await {
                    Err(e) if e.is_duplicate() => {
                        self.api
                            .update_domain_entry(self.profile_id, list, &entry)
                            .await
                    }
                    other => other,
                }
            }
            Operation::Remove { identifier } => {
                match self
                    .api
                    .delete_domain_entry(self.profile_id, list, identifier)
                    .await
                {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
            Operation::Replace(entries) => {
                let entries: Vec<RemoteEntry> = entries
                    .iter()
                    .map(|e| RemoteEntry::new(&e.identifier, e.active))
                    .collect();
                self.api
                    .sync_domain_list(self.profile_id, list, &entries)
                    .await
            }
        }
    }

    /// ID-only collections have no per-entry calls, so single-entry
    /// operations read the collection and write it back
    async fn apply_id_op(&self, collection: Collection, op: &Operation) -> ApiResult<()> {
        let replacement = match op {
            Operation::Replace(entries) => ids(entries),
            Operation::Add { identifier, .. } => {
                let mut current = self.get_ids(collection).await?;
                if current.iter().any(|id| id.eq_ignore_ascii_case(identifier)) {
                    return Ok(());
                }
                current.push(identifier.clone());
                current
            }
            Operation::Remove { identifier } => {
                let mut current = self.get_ids(collection).await?;
                current.retain(|id| !id.eq_ignore_ascii_case(identifier));
                current
            }
        };
        self.put_ids(collection, &replacement).await
    }

    async fn get_ids(&self, collection: Collection) -> ApiResult<Vec<String>> {
        match collection {
            Collection::BlockedTlds => self.api.get_security_tlds(self.profile_id).await,
            Collection::PrivacyBlocklists => {
                Ok(self.api.get_privacy(self.profile_id).await?.blocklists)
            }
            Collection::PrivacyNatives => Ok(self.api.get_privacy(self.profile_id).await?.natives),
            other => Err(ApiError::Transient(format!(
                "{} does not hold entries",
                other
            ))),
        }
    }

    async fn put_ids(&self, collection: Collection, ids: &[String]) -> ApiResult<()> {
        match collection {
            Collection::BlockedTlds => self.api.sync_security_tlds(self.profile_id, ids).await,
            Collection::PrivacyBlocklists => {
                self.api.sync_privacy_blocklists(self.profile_id, ids).await
            }
            Collection::PrivacyNatives => self.api.sync_privacy_natives(self.profile_id, ids).await,
            other => Err(ApiError::Transient(format!(
                "{} does not hold entries",
                other
            ))),
        }
    }

    /// Sync every managed collection of `desired`
    pub async fn sync_profile(&self, desired: &DesiredState) -> SyncReport {
        let mut report = SyncReport::default();

        // A missing profile or a rejected key fails every later call the same way
        let name = self.sync_name(&desired.name).await;
        let stop = matches!(name, Err(ApiError::NotFound(_)) | Err(ApiError::Auth(_)));
        report.outcomes.push(self.record(Collection::Profile, name));
        if stop {
            return report;
        }

        if let Some(ref security) = desired.security {
            let result = self.sync_flags(Collection::Security, security).await;
            report.outcomes.push(self.record(Collection::Security, result));
        }

        let tlds = self.sync_ids(Collection::BlockedTlds, &desired.blocked_tlds).await;
        report.outcomes.push(self.record(Collection::BlockedTlds, tlds));

        if let Some(ref privacy) = desired.privacy {
            let result = self.sync_flags(Collection::Privacy, privacy).await;
            report.outcomes.push(self.record(Collection::Privacy, result));
        }
        if let Some(ref blocklists) = desired.privacy_blocklists {
            let result = self.sync_ids(Collection::PrivacyBlocklists, blocklists).await;
            report
                .outcomes
                .push(self.record(Collection::PrivacyBlocklists, result));
        }
        if let Some(ref natives) = desired.privacy_natives {
            let result = self.sync_ids(Collection::PrivacyNatives, natives).await;
            report
                .outcomes
                .push(self.record(Collection::PrivacyNatives, result));
        }

        if let Some(ref parental) = desired.parental_control {
            let result = self.sync_flags(Collection::ParentalControl, parental).await;
            report
                .outcomes
                .push(self.record(Collection::ParentalControl, result));
        }

        let denylist = self.sync_domain_list(Collection::Denylist, &desired.denylist).await;
        report.outcomes.push(self.record(Collection::Denylist, denylist));

        let allowlist = self
            .sync_domain_list(Collection::Allowlist, &desired.allowlist)
            .await;
        report
            .outcomes
            .push(self.record(Collection::Allowlist, allowlist));

        if let Some(ref settings) = desired.settings {
            let result = self.sync_settings(settings).await;
            report.outcomes.push(self.record(Collection::Settings, result));
        }

        info!(
            profile_id = %self.profile_id,
            collections = report.outcomes.len(),
            failed = report.failed().len(),
            mutations = report.mutations(),
            "Sync pass finished"
        );
        report
    }

    fn record(&self, collection: Collection, result: ApiResult<usize>) -> CollectionOutcome {
        match result {
            Ok(mutations) => {
                metrics::record_collection_sync(collection, true);
                metrics::record_remote_mutations(collection, mutations);
            }
            Err(ref e) => {
                metrics::record_collection_sync(collection, false);
                warn!(
                    profile_id = %self.profile_id,
                    collection = %collection,
                    error = %e,
                    "Collection sync failed"
                );
            }
        }
        CollectionOutcome { collection, result }
    }

    async fn sync_name(&self, name: &str) -> ApiResult<usize> {
        let remote = self.api.get_profile(self.profile_id).await?;
        if remote.name == name {
            return Ok(0);
        }
        self.api.update_profile(self.profile_id, name).await?;
        Ok(1)
    }

    async fn sync_ids(&self, collection: Collection, desired: &[String]) -> ApiResult<usize> {
        let remote = self.get_ids(collection).await?;
        match diff_ids(desired, &remote) {
            Some(replacement) => {
                self.put_ids(collection, &replacement).await?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn sync_domain_list(
        &self,
        collection: Collection,
        desired: &[DesiredEntry],
    ) -> ApiResult<usize> {
        let list = domain_list(collection).ok_or_else(|| {
            ApiError::Transient(format!("{} is not a domain list", collection))
        })?;
        let remote = self.api.get_domain_list(self.profile_id, list).await?;
        let ops = diff(desired, &remote, self.list_mode);
        self.apply(collection, &ops).await
    }

    async fn sync_flags<P: FlagPatch>(&self, collection: Collection, desired: &P) -> ApiResult<usize> {
        let Some(changes) = desired.changes(self.api, self.profile_id).await? else {
            return Ok(0);
        };
        debug!(collection = %collection, "Updating flags");
        changes.push(self.api, self.profile_id).await?;
        Ok(1)
    }

    /// Each settings group is attempted even if a sibling fails
    async fn sync_settings(&self, desired: &DesiredSettings) -> ApiResult<usize> {
        let remote = self.api.get_settings(self.profile_id).await?;
        let mut mutations = 0;
        let mut errors = Vec::new();

        if let Some(patch) = desired.logs.as_ref().and_then(|p| p.changes_from(&remote.logs)) {
            match self.api.update_logs_settings(self.profile_id, &patch).await {
                Ok(()) => mutations += 1,
                Err(e) => errors.push(("logs", e)),
            }
        }
        if let Some(patch) = desired
            .block_page
            .as_ref()
            .and_then(|p| p.changes_from(&remote.block_page))
        {
            match self.api.update_block_page_settings(self.profile_id, &patch).await {
                Ok(()) => mutations += 1,
                Err(e) => errors.push(("blockPage", e)),
            }
        }
        if let Some(patch) = desired
            .performance
            .as_ref()
            .and_then(|p| p.changes_from(&remote.performance))
        {
            match self.api.update_performance_settings(self.profile_id, &patch).await {
                Ok(()) => mutations += 1,
                Err(e) => errors.push(("performance", e)),
            }
        }
        if let Some(patch) = desired.general.changes_from(&remote.general) {
            match self.api.update_settings(self.profile_id, &patch).await {
                Ok(()) => mutations += 1,
                Err(e) => errors.push(("general", e)),
            }
        }

        for (group, e) in &errors {
            warn!(profile_id = %self.profile_id, group = group, error = %e, "Settings update failed");
        }
        match most_severe(errors.iter().map(|(_, e)| e)) {
            Some(worst) => Err(worst.clone()),
            None => Ok(mutations),
        }
    }
}

/// A flag patch that knows how to read and write its remote group
#[async_trait::async_trait]
trait FlagPatch: Send + Sync + Sized {
    /// Fields that need changing, or `None` when converged
    async fn changes(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<Option<Self>>;

    async fn push(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<()>;
}

#[async_trait::async_trait]
impl FlagPatch for crate::api::SecurityPatch {
    async fn changes(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<Option<Self>> {
        Ok(self.changes_from(&api.get_security(profile_id).await?))
    }

    async fn push(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<()> {
        api.update_security(profile_id, self).await
    }
}

#[async_trait::async_trait]
impl FlagPatch for crate::api::PrivacyPatch {
    async fn changes(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<Option<Self>> {
        Ok(self.changes_from(&api.get_privacy(profile_id).await?.settings))
    }

    async fn push(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<()> {
        api.update_privacy(profile_id, self).await
    }
}

#[async_trait::async_trait]
impl FlagPatch for crate::api::ParentalControlPatch {
    async fn changes(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<Option<Self>> {
        Ok(self.changes_from(&api.get_parental_control(profile_id).await?))
    }

    async fn push(&self, api: &dyn PolicyApi, profile_id: &str) -> ApiResult<()> {
        api.update_parental_control(profile_id, self).await
    }
}
