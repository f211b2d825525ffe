//! Dependent-trigger index
//!
//! Answers "which profiles must be reconciled when this shared list or
//! secret changes". Derived from the current set of profile specs and never
//! cached across calls, so it cannot go stale.

use crate::resources::{ListKind, Profile, ResourceKey};
use crate::store::{ResourceStore, StoreResult};
use std::collections::{BTreeMap, BTreeSet};

/// Something a profile depends on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependencyTarget {
    List(ListKind, ResourceKey),
    Secret(ResourceKey),
}

/// Every target `profile` depends on
pub fn targets_of(profile: &Profile) -> BTreeSet<DependencyTarget> {
    let namespace = &profile.metadata.namespace;
    let mut targets: BTreeSet<DependencyTarget> = ListKind::ALL
        .into_iter()
        .flat_map(|kind| {
            profile
                .spec
                .refs(kind)
                .iter()
                .map(move |r| DependencyTarget::List(kind, r.to_key(namespace)))
        })
        .collect();
    targets.insert(DependencyTarget::Secret(ResourceKey::new(
        namespace,
        &profile.spec.credentials_ref.name,
    )));
    targets
}

/// Reverse index from dependency targets to profiles
#[derive(Debug, Default)]
pub struct DependentIndex {
    by_target: BTreeMap<DependencyTarget, BTreeSet<ResourceKey>>,
}

impl DependentIndex {
    pub fn from_profiles<'a>(profiles: impl IntoIterator<Item = &'a Profile>) -> Self {
        let mut by_target: BTreeMap<DependencyTarget, BTreeSet<ResourceKey>> = BTreeMap::new();
        for profile in profiles {
            let key = profile.metadata.key();
            for target in targets_of(profile) {
                by_target.entry(target).or_default().insert(key.clone());
            }
        }
        Self { by_target }
    }

    /// Profiles depending on `target`, sorted by key
    pub fn dependents_of(&self, target: &DependencyTarget) -> Vec<ResourceKey> {
        self.by_target
            .get(target)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Profiles currently depending on `target`
///
/// Only profiles in the target's namespace or pointing at it explicitly can
/// match, but every namespace is scanned since references may cross them.
pub async fn find_dependents(
    store: &dyn ResourceStore,
    target: &DependencyTarget,
) -> StoreResult<Vec<ResourceKey>> {
    let profiles = store.list_profiles(None).await?;
    Ok(DependentIndex::from_profiles(&profiles).dependents_of(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ObjectMeta, ProfileSpec, ResourceRef};
    use crate::store::InMemoryStore;

    fn profile(name: &str, denylists: &[ResourceRef]) -> Profile {
        let mut spec = ProfileSpec::new(name, "creds");
        spec.denylist_refs = denylists.to_vec();
        Profile::new(ObjectMeta::new("home", name), spec)
    }

    #[test]
    fn test_reverse_lookup() {
        let profiles = vec![
            profile("p1", &[ResourceRef::new("ads")]),
            profile("p2", &[ResourceRef::new("ads"), ResourceRef::new("malware")]),
            profile("p3", &[ResourceRef::new("malware")]),
        ];
        let index = DependentIndex::from_profiles(&profiles);

        let ads = DependencyTarget::List(ListKind::Denylist, ResourceKey::new("home", "ads"));
        assert_eq!(
            index.dependents_of(&ads),
            vec![ResourceKey::new("home", "p1"), ResourceKey::new("home", "p2")]
        );

        let other_kind = DependencyTarget::List(ListKind::Allowlist, ResourceKey::new("home", "ads"));
        assert!(index.dependents_of(&other_kind).is_empty());

        let secret = DependencyTarget::Secret(ResourceKey::new("home", "creds"));
        assert_eq!(index.dependents_of(&secret).len(), 3);
    }

    #[test]
    fn test_cross_namespace_reference() {
        let profiles = vec![profile("p1", &[ResourceRef::in_namespace("ads", "shared")])];
        let index = DependentIndex::from_profiles(&profiles);

        let local = DependencyTarget::List(ListKind::Denylist, ResourceKey::new("home", "ads"));
        let shared = DependencyTarget::List(ListKind::Denylist, ResourceKey::new("shared", "ads"));
        assert!(index.dependents_of(&local).is_empty());
        assert_eq!(index.dependents_of(&shared), vec![ResourceKey::new("home", "p1")]);
    }

    #[tokio::test]
    async fn test_find_dependents_reads_current_specs() {
        let store = InMemoryStore::new();
        store.apply_profile(profile("p1", &[ResourceRef::new("ads")])).await.unwrap();
        let target = DependencyTarget::List(ListKind::Denylist, ResourceKey::new("home", "ads"));

        assert_eq!(find_dependents(&store, &target).await.unwrap().len(), 1);

        store.apply_profile(profile("p1", &[])).await.unwrap();
        assert!(find_dependents(&store, &target).await.unwrap().is_empty());
    }
}
