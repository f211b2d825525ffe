//! Reference resolution
//!
//! Turns a profile's references and inline entries into one merged,
//! deduplicated document per list kind. The merge is a pure function of the
//! profile spec and the fetched shared list specs.
//!
//! Merge rules, per kind:
//! - sources are taken in declaration order: referenced lists in reference
//!   order, then the inline entries
//! - an inactive entry in any source removes that identifier from the result
//! - among active entries the first occurrence of an identifier wins; the
//!   identifier is compared after [`ListKind::normalize`]

use crate::resources::{ListEntry, ListKind, Profile, ResourceKey, SharedList};
use crate::store::{ResourceStore, StoreError};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, instrument};

/// A declared reference points at a shared list that does not exist
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} {namespace}/{name} not found")]
pub struct ReferenceNotFoundError {
    pub kind: ListKind,
    pub namespace: String,
    pub name: String,
}

impl ReferenceNotFoundError {
    pub fn new(kind: ListKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error(transparent)]
    ReferenceNotFound(ReferenceNotFoundError),

    #[error("failed to read shared list: {0}")]
    Store(StoreError),
}

/// Where a merged entry came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntrySource {
    Inline,
    Shared(ResourceKey),
}

/// One entry of the merged document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntry {
    /// Normalized identifier
    pub identifier: String,
    pub active: bool,
    pub reason: Option<String>,
    pub source: EntrySource,
}

/// Merged desired state of the three list kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergedDocument {
    pub allowlist: Vec<MergedEntry>,
    pub denylist: Vec<MergedEntry>,
    pub tlds: Vec<MergedEntry>,
}

impl MergedDocument {
    pub fn get(&self, kind: ListKind) -> &[MergedEntry] {
        match kind {
            ListKind::Allowlist => &self.allowlist,
            ListKind::Denylist => &self.denylist,
            ListKind::TldList => &self.tlds,
        }
    }

    fn get_mut(&mut self, kind: ListKind) -> &mut Vec<MergedEntry> {
        match kind {
            ListKind::Allowlist => &mut self.allowlist,
            ListKind::Denylist => &mut self.denylist,
            ListKind::TldList => &mut self.tlds,
        }
    }

    /// Identifiers of one kind, in merge order
    pub fn identifiers(&self, kind: ListKind) -> Vec<&str> {
        self.get(kind).iter().map(|e| e.identifier.as_str()).collect()
    }
}

/// A reference that resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub kind: ListKind,
    pub key: ResourceKey,
    /// Active entries declared by the list
    pub active_entries: usize,
    pub generation: i64,
}

/// Result of resolving one profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub document: MergedDocument,
    pub references: Vec<ResolvedReference>,
}

/// Merge ordered sources of one kind
pub fn merge<'a>(
    kind: ListKind,
    sources: impl IntoIterator<Item = (EntrySource, &'a [ListEntry])>,
) -> Vec<MergedEntry> {
    let sources: Vec<(EntrySource, &[ListEntry])> = sources.into_iter().collect();

    let tombstones: HashSet<String> = sources
        .iter()
        .flat_map(|(_, entries)| entries.iter())
        .filter(|e| !e.active)
        .map(|e| kind.normalize(&e.value))
        .collect();

    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for (source, entries) in &sources {
        for entry in entries.iter().filter(|e| e.active) {
            let identifier = kind.normalize(&entry.value);
            if identifier.is_empty() || tombstones.contains(&identifier) {
                continue;
            }
            if !seen.insert(identifier.clone()) {
                continue;
            }
            merged.push(MergedEntry {
                identifier,
                active: true,
                reason: entry.reason.clone(),
                source: source.clone(),
            });
        }
    }
    merged
}

/// Build the merged document from a profile and its already fetched lists
///
/// `lists` must hold, per kind, the lists in the profile's reference order.
pub fn merge_document(profile: &Profile, lists: &[SharedList]) -> MergedDocument {
    let mut document = MergedDocument::default();
    for kind in ListKind::ALL {
        let shared = lists
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| (EntrySource::Shared(l.metadata.key()), l.spec.entries.as_slice()));
        let inline = std::iter::once((EntrySource::Inline, profile.spec.inline_entries(kind)));
        *document.get_mut(kind) = merge(kind, shared.chain(inline));
    }
    document
}

/// Fetches referenced lists and merges them
pub struct Resolver<'a> {
    store: &'a dyn ResourceStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn ResourceStore) -> Self {
        Self { store }
    }

    /// Resolve every reference of `profile`, aborting on the first missing list
    #[instrument(skip_all, fields(profile = %profile.metadata.key()))]
    pub async fn resolve(&self, profile: &Profile) -> Result<Resolution, ResolveError> {
        let namespace = &profile.metadata.namespace;
        let mut lists = Vec::new();
        let mut references = Vec::new();

        for kind in ListKind::ALL {
            for reference in profile.spec.refs(kind) {
                let key = reference.to_key(namespace);
                let list = match self.store.get_list(kind, &key).await {
                    Ok(list) => list,
                    Err(e) if e.is_not_found() => {
                        debug!(kind = %kind, reference = %key, "Reference not found");
                        return Err(ResolveError::ReferenceNotFound(ReferenceNotFoundError::new(
                            kind,
                            &key.namespace,
                            &key.name,
                        )));
                    }
                    Err(e) => return Err(ResolveError::Store(e)),
                };

                references.push(ResolvedReference {
                    kind,
                    key,
                    active_entries: list.spec.active_entries().count(),
                    generation: list.metadata.generation,
                });
                lists.push(list);
            }
        }

        let document = merge_document(profile, &lists);
        debug!(
            allowlist = document.allowlist.len(),
            denylist = document.denylist.len(),
            tlds = document.tlds.len(),
            references = references.len(),
            "Resolved references"
        );

        Ok(Resolution {
            document,
            references,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ObjectMeta, ProfileSpec, ResourceRef, SharedListSpec};
    use crate::store::InMemoryStore;

    fn entries(values: &[&str]) -> Vec<ListEntry> {
        values.iter().map(|v| ListEntry::new(*v)).collect()
    }

    fn shared(name: &str) -> EntrySource {
        EntrySource::Shared(ResourceKey::new("home", name))
    }

    #[test]
    fn test_merge_dedupes_first_occurrence() {
        let l1 = entries(&["a.com", "b.com"]);
        let l2 = entries(&["B.com", "c.com"]);
        let inline = entries(&["d.com"]);

        let merged = merge(
            ListKind::Denylist,
            vec![
                (shared("l1"), l1.as_slice()),
                (shared("l2"), l2.as_slice()),
                (EntrySource::Inline, inline.as_slice()),
            ],
        );

        let ids: Vec<&str> = merged.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["a.com", "b.com", "c.com", "d.com"]);
        assert_eq!(merged[1].source, shared("l1"));
        assert_eq!(merged[3].source, EntrySource::Inline);
    }

    #[test]
    fn test_inactive_entry_wins_in_either_order() {
        let active = entries(&["x.com", "y.com"]);
        let inactive = vec![ListEntry::inactive("X.com")];

        for order in [
            vec![(shared("on"), active.as_slice()), (shared("off"), inactive.as_slice())],
            vec![(shared("off"), inactive.as_slice()), (shared("on"), active.as_slice())],
        ] {
            let merged = merge(ListKind::Denylist, order);
            let ids: Vec<&str> = merged.iter().map(|e| e.identifier.as_str()).collect();
            assert_eq!(ids, vec!["y.com"]);
        }
    }

    #[test]
    fn test_tld_normalization() {
        let tlds = vec![ListEntry::new(".ZIP"), ListEntry::new("zip"), ListEntry::new("mov")];
        let merged = merge(ListKind::TldList, vec![(EntrySource::Inline, tlds.as_slice())]);
        let ids: Vec<&str> = merged.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(ids, vec!["zip", "mov"]);
    }

    #[tokio::test]
    async fn test_resolve_reports_missing_reference() {
        let store = InMemoryStore::new();
        store
            .apply_list(SharedList::new(
                ListKind::Denylist,
                ObjectMeta::new("home", "ads"),
                SharedListSpec {
                    description: None,
                    entries: entries(&["ads.example"]),
                },
            ))
            .await;

        let mut spec = ProfileSpec::new("Kids", "creds");
        spec.denylist_refs.push(ResourceRef::new("ads"));
        spec.allowlist_refs.push(ResourceRef::in_namespace("school", "shared"));
        let profile = Profile::new(ObjectMeta::new("home", "kids"), spec);

        let err = Resolver::new(&store).resolve(&profile).await.unwrap_err();
        match err {
            ResolveError::ReferenceNotFound(missing) => {
                assert_eq!(missing.kind, ListKind::Allowlist);
                assert_eq!(missing.key(), ResourceKey::new("shared", "school"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_resolve_merges_references_then_inline() {
        let store = InMemoryStore::new();
        for (name, values) in [("l1", vec!["a.com", "b.com"]), ("l2", vec!["b.com", "c.com"])] {
            store
                .apply_list(SharedList::new(
                    ListKind::Denylist,
                    ObjectMeta::new("home", name),
                    SharedListSpec {
                        description: None,
                        entries: entries(&values),
                    },
                ))
                .await;
        }

        let mut spec = ProfileSpec::new("Kids", "creds");
        spec.denylist_refs = vec![ResourceRef::new("l1"), ResourceRef::new("l2")];
        spec.denylist = entries(&["d.com"]);
        let profile = Profile::new(ObjectMeta::new("home", "kids"), spec);

        let resolution = Resolver::new(&store).resolve(&profile).await.unwrap();
        assert_eq!(
            resolution.document.identifiers(ListKind::Denylist),
            vec!["a.com", "b.com", "c.com", "d.com"]
        );
        assert_eq!(resolution.references.len(), 2);
        assert_eq!(resolution.references[0].active_entries, 2);
    }
}
