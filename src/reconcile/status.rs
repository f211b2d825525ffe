//! Status computation and writes
//!
//! Status is derived from the previous status plus the outcome of one
//! reconcile. Counts and per-collection entries of collections that failed
//! keep their previous values. Writes retry on resource-version conflicts
//! and are skipped when nothing changed.

use super::desired::DesiredState;
use super::error::ReconcileError;
use super::executor::SyncReport;
use super::resolver::Resolution;
use crate::resources::{
    set_condition, Collection, CollectionStatus, Condition, ConditionStatus, ListKind, Phase,
    Profile, ProfileReference, ProfileStatus, ReferenceStatus, ResourceKey, SharedList,
    SharedListStatus, SyncCounts, READY, REFERENCES_RESOLVED, SYNCED,
};
use crate::retry::{with_retry, BackoffConfig};
use crate::store::{ResourceStore, StoreResult};
use chrono::{DateTime, Utc};
use std::collections::HashSet;

/// Attempts for a status write losing optimistic-concurrency races
const STATUS_WRITE_RETRIES: u32 = 5;

fn reference_statuses(resolution: &Resolution) -> Vec<ReferenceStatus> {
    resolution
        .references
        .iter()
        .map(|r| ReferenceStatus {
            kind: r.kind,
            namespace: r.key.namespace.clone(),
            name: r.key.name.clone(),
            ready: true,
            active_entries: r.active_entries,
            message: None,
        })
        .collect()
}

/// Status after the ID of a newly created remote profile is known
pub fn created_status(profile: &Profile, profile_id: &str) -> ProfileStatus {
    let mut status = profile.status.clone().unwrap_or_default();
    status.profile_id = Some(profile_id.to_string());
    status.phase = Phase::Syncing;
    status
}

/// Status after a sync pass, full or partial
pub fn synced_status(
    profile: &Profile,
    profile_id: &str,
    resolution: &Resolution,
    desired: &DesiredState,
    report: &SyncReport,
    now: DateTime<Utc>,
) -> ProfileStatus {
    let previous = profile.status.clone().unwrap_or_default();
    let generation = profile.metadata.generation;
    let succeeded = report.succeeded();
    let target = desired.counts();

    let mut counts = previous.counts.clone();
    let mut take = |collection: Collection, apply: fn(&mut SyncCounts, &SyncCounts)| {
        if report.synced(collection) {
            apply(&mut counts, &target);
        }
    };
    take(Collection::Allowlist, |c, t| c.allowlist = t.allowlist);
    take(Collection::Denylist, |c, t| c.denylist = t.denylist);
    take(Collection::BlockedTlds, |c, t| c.blocked_tlds = t.blocked_tlds);
    take(Collection::PrivacyBlocklists, |c, t| {
        c.privacy_blocklists = t.privacy_blocklists
    });
    take(Collection::PrivacyNatives, |c, t| c.privacy_natives = t.privacy_natives);
    take(Collection::ParentalControl, |c, t| {
        c.parental_services = t.parental_services;
        c.parental_categories = t.parental_categories;
    });

    let collections: Vec<CollectionStatus> = report
        .outcomes
        .iter()
        .map(|o| CollectionStatus {
            collection: o.collection,
            synced: o.is_ok(),
            message: o.result.as_ref().err().map(|e| e.to_string()),
        })
        .collect();

    let mut conditions = previous.conditions.clone();
    set_condition(
        &mut conditions,
        Condition::new(REFERENCES_RESOLVED, true, "Resolved", "", now).with_generation(generation),
    );
    match report.error() {
        None => {
            set_condition(
                &mut conditions,
                Condition::new(SYNCED, true, "Synced", "", now).with_generation(generation),
            );
            set_condition(
                &mut conditions,
                Condition::new(READY, true, "Ready", "", now).with_generation(generation),
            );
        }
        Some(err) => {
            let message = err.to_string();
            set_condition(
                &mut conditions,
                Condition::new(SYNCED, false, err.reason(), message.clone(), now)
                    .with_generation(generation),
            );
            set_condition(
                &mut conditions,
                Condition::new(READY, false, err.reason(), message, now)
                    .with_generation(generation),
            );
        }
    }

    ProfileStatus {
        profile_id: Some(profile_id.to_string()),
        phase: if succeeded { Phase::Ready } else { Phase::Error },
        counts,
        collections,
        references: reference_statuses(resolution),
        conditions,
        last_synced_at: if succeeded { Some(now) } else { previous.last_synced_at },
        observed_generation: if succeeded {
            Some(generation)
        } else {
            previous.observed_generation
        },
    }
}

/// Status after a reconcile that failed before or outside the sync pass
///
/// Previously synced counts, collections and references are kept. A missing
/// reference is marked not ready.
pub fn failed_status(profile: &Profile, error: &ReconcileError, now: DateTime<Utc>) -> ProfileStatus {
    let mut status = profile.status.clone().unwrap_or_default();
    let generation = profile.metadata.generation;
    let message = error.to_string();
    let reason = error.reason();

    status.phase = Phase::Error;

    match error {
        ReconcileError::ReferenceNotFound(missing) => {
            let existing = status
                .references
                .iter_mut()
                .find(|r| r.kind == missing.kind && r.namespace == missing.namespace && r.name == missing.name);
            match existing {
                Some(reference) => {
                    reference.ready = false;
                    reference.message = Some("not found".to_string());
                }
                None => status.references.push(ReferenceStatus {
                    kind: missing.kind,
                    namespace: missing.namespace.clone(),
                    name: missing.name.clone(),
                    ready: false,
                    active_entries: 0,
                    message: Some("not found".to_string()),
                }),
            }
            set_condition(
                &mut status.conditions,
                Condition::new(REFERENCES_RESOLVED, false, reason, message.clone(), now)
                    .with_generation(generation),
            );
        }
        ReconcileError::Validation(_) => {
            set_condition(
                &mut status.conditions,
                Condition::new(SYNCED, ConditionStatus::Unknown, reason, message.clone(), now)
                    .with_generation(generation),
            );
        }
        _ => {
            set_condition(
                &mut status.conditions,
                Condition::new(SYNCED, false, reason, message.clone(), now)
                    .with_generation(generation),
            );
        }
    }
    set_condition(
        &mut status.conditions,
        Condition::new(READY, false, reason, message, now).with_generation(generation),
    );
    status
}

/// Status while the remote profile is being removed
pub fn deleting_status(profile: &Profile, now: DateTime<Utc>) -> ProfileStatus {
    let mut status = profile.status.clone().unwrap_or_default();
    status.phase = Phase::Deleting;
    set_condition(
        &mut status.conditions,
        Condition::new(READY, false, "Deleting", "remote profile cleanup in progress", now),
    );
    status
}

/// Whether two statuses differ in anything but the last sync time
pub fn differs(old: Option<&ProfileStatus>, new: &ProfileStatus) -> bool {
    match old {
        None => true,
        Some(old) => {
            let mut old = old.clone();
            old.last_synced_at = new.last_synced_at;
            old != *new
        }
    }
}

/// Write a profile status computed from the latest stored object
///
/// `compute` returns `None` to skip the write. Conflicts refetch and
/// recompute. Returns the stored profile, or `NotFound` if it disappeared.
pub async fn write_profile_status<F>(
    store: &dyn ResourceStore,
    key: &ResourceKey,
    compute: F,
) -> StoreResult<Profile>
where
    F: Fn(&Profile) -> Option<ProfileStatus> + Send + Sync,
{
    let compute = &compute;
    with_retry(
        &BackoffConfig::quick(),
        STATUS_WRITE_RETRIES,
        "write profile status",
        || async move {
            let mut profile = store.get_profile(key).await?;
            match compute(&profile) {
                Some(status) => {
                    profile.status = Some(status);
                    store.update_profile_status(&profile).await
                }
                None => Ok(profile),
            }
        },
    )
    .await
}

/// Status of a shared list: active entries, referencing profiles and validity
pub fn list_status(
    list: &SharedList,
    dependents: &[ResourceKey],
    invalid: Option<String>,
    now: DateTime<Utc>,
) -> SharedListStatus {
    let previous = list.status.clone().unwrap_or_default();
    let generation = list.metadata.generation;

    let active: HashSet<String> = list
        .spec
        .active_entries()
        .map(|e| list.kind.normalize(&e.value))
        .filter(|v| !v.is_empty())
        .collect();

    let mut profile_refs: Vec<ProfileReference> = dependents
        .iter()
        .map(|k| ProfileReference {
            namespace: k.namespace.clone(),
            name: k.name.clone(),
        })
        .collect();
    profile_refs.sort();
    profile_refs.dedup();

    let mut conditions = previous.conditions.clone();
    let ready = match invalid {
        None => Condition::new(READY, true, "Valid", "", now),
        Some(message) => Condition::new(READY, false, "InvalidEntries", message, now),
    };
    set_condition(&mut conditions, ready.with_generation(generation));

    SharedListStatus {
        active_count: active.len(),
        profile_refs,
        conditions,
        observed_generation: Some(generation),
    }
}

/// Write a shared list status computed from the latest stored object
pub async fn write_list_status<F>(
    store: &dyn ResourceStore,
    kind: ListKind,
    key: &ResourceKey,
    compute: F,
) -> StoreResult<SharedList>
where
    F: Fn(&SharedList) -> Option<SharedListStatus> + Send + Sync,
{
    let compute = &compute;
    with_retry(
        &BackoffConfig::quick(),
        STATUS_WRITE_RETRIES,
        "write list status",
        || async move {
            let mut list = store.get_list(kind, key).await?;
            match compute(&list) {
                Some(status) => {
                    list.status = Some(status);
                    store.update_list_status(&list).await
                }
                None => Ok(list),
            }
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::reconcile::executor::CollectionOutcome;
    use crate::reconcile::resolver::{ReferenceNotFoundError, ResolvedReference};
    use crate::reconcile::DesiredEntry;
    use crate::resources::{find_condition, ListEntry, ObjectMeta, ProfileSpec, SharedListSpec};

    fn profile() -> Profile {
        let mut profile = Profile::new(ObjectMeta::new("home", "kids"), ProfileSpec::new("Kids", "creds"));
        profile.metadata.generation = 2;
        profile
    }

    fn report(outcomes: Vec<(Collection, Result<usize, ApiError>)>) -> SyncReport {
        SyncReport {
            outcomes: outcomes
                .into_iter()
                .map(|(collection, result)| CollectionOutcome { collection, result })
                .collect(),
        }
    }

    fn desired() -> DesiredState {
        DesiredState {
            denylist: vec![DesiredEntry::active("a.com"), DesiredEntry::active("b.com")],
            allowlist: vec![DesiredEntry::active("c.com")],
            ..Default::default()
        }
    }

    #[test]
    fn test_full_success_is_ready() {
        let resolution = Resolution {
            references: vec![ResolvedReference {
                kind: ListKind::Denylist,
                key: ResourceKey::new("home", "ads"),
                active_entries: 2,
                generation: 1,
            }],
            ..Default::default()
        };
        let report = report(vec![
            (Collection::Profile, Ok(0)),
            (Collection::Denylist, Ok(2)),
            (Collection::Allowlist, Ok(1)),
        ]);
        let now = Utc::now();

        let status = synced_status(&profile(), "abc123", &resolution, &desired(), &report, now);

        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.last_synced_at, Some(now));
        assert_eq!(status.counts.denylist, 2);
        assert_eq!(status.counts.allowlist, 1);
        assert!(status.references[0].ready);
        assert!(find_condition(&status.conditions, READY).unwrap().is_true());
    }

    #[test]
    fn test_partial_failure_keeps_previous_counts() {
        let mut profile = profile();
        profile.status = Some(ProfileStatus {
            counts: SyncCounts {
                allowlist: 7,
                ..Default::default()
            },
            observed_generation: Some(1),
            ..Default::default()
        });
        let report = report(vec![
            (Collection::Profile, Ok(0)),
            (Collection::Denylist, Ok(2)),
            (Collection::Allowlist, Err(ApiError::Transient("503".into()))),
        ]);

        let status = synced_status(
            &profile,
            "abc123",
            &Resolution::default(),
            &desired(),
            &report,
            Utc::now(),
        );

        assert_eq!(status.phase, Phase::Error);
        assert_eq!(status.counts.denylist, 2);
        assert_eq!(status.counts.allowlist, 7);
        assert_eq!(status.observed_generation, Some(1));
        let synced = find_condition(&status.conditions, SYNCED).unwrap();
        assert_eq!(synced.status, ConditionStatus::False);
        assert_eq!(synced.reason, "PartialSync");
        assert!(!status.collections[2].synced);
    }

    #[test]
    fn test_missing_reference_marks_reference() {
        let mut profile = profile();
        profile.status = Some(ProfileStatus {
            references: vec![ReferenceStatus {
                kind: ListKind::Denylist,
                namespace: "home".into(),
                name: "ads".into(),
                ready: true,
                active_entries: 3,
                message: None,
            }],
            ..Default::default()
        });
        let error = ReconcileError::ReferenceNotFound(ReferenceNotFoundError::new(
            ListKind::Denylist,
            "home",
            "ads",
        ));

        let status = failed_status(&profile, &error, Utc::now());

        assert_eq!(status.phase, Phase::Error);
        assert!(!status.references[0].ready);
        let resolved = find_condition(&status.conditions, REFERENCES_RESOLVED).unwrap();
        assert_eq!(resolved.reason, "ReferenceNotFound");
        assert!(resolved.message.contains("home/ads"));
    }

    #[test]
    fn test_differs_ignores_sync_time() {
        let old = ProfileStatus {
            last_synced_at: Some(Utc::now()),
            ..Default::default()
        };
        let mut new = old.clone();
        new.last_synced_at = Some(Utc::now() + chrono::Duration::seconds(60));
        assert!(!differs(Some(&old), &new));

        new.phase = Phase::Error;
        assert!(differs(Some(&old), &new));
    }

    #[test]
    fn test_list_status_counts_distinct_active() {
        let spec = SharedListSpec {
            description: None,
            entries: vec![
                ListEntry::new("a.com"),
                ListEntry::new("A.com."),
                ListEntry::inactive("b.com"),
            ],
        };
        let list = SharedList::new(ListKind::Denylist, ObjectMeta::new("home", "ads"), spec);
        let dependents = vec![ResourceKey::new("home", "p2"), ResourceKey::new("home", "p1")];

        let status = list_status(&list, &dependents, None, Utc::now());

        assert_eq!(status.active_count, 1);
        assert_eq!(status.profile_refs[0].name, "p1");
        assert!(find_condition(&status.conditions, READY).unwrap().is_true());
    }
}
