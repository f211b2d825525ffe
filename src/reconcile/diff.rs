//! Remote state differencing
//!
//! Computes the minimal operation list that moves one remote collection to
//! its desired state. Identifiers compare case-insensitively. Nothing is
//! emitted when the collection is already converged.

use crate::api::RemoteEntry;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// How a collection is synced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// Per-entry add and remove calls
    #[default]
    Granular,
    /// One call replacing the whole collection
    Replace,
}

impl fmt::Display for DiffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffMode::Granular => write!(f, "granular"),
            DiffMode::Replace => write!(f, "replace"),
        }
    }
}

/// Desired state of one collection entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct DesiredEntry {
    pub identifier: String,
    pub active: bool,
}

impl DesiredEntry {
    pub fn new(identifier: impl Into<String>, active: bool) -> Self {
        Self {
            identifier: identifier.into(),
            active,
        }
    }

    pub fn active(identifier: impl Into<String>) -> Self {
        Self::new(identifier, true)
    }
}

/// One remote mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Add the entry, or set its active flag if it exists
    Add { identifier: String, active: bool },
    Remove { identifier: String },
    /// Replace the whole collection; entries sorted by identifier
    Replace(Vec<DesiredEntry>),
}

impl Operation {
    pub fn add(identifier: impl Into<String>, active: bool) -> Self {
        Operation::Add {
            identifier: identifier.into(),
            active,
        }
    }

    pub fn remove(identifier: impl Into<String>) -> Self {
        Operation::Remove {
            identifier: identifier.into(),
        }
    }
}

fn fold(identifier: &str) -> String {
    identifier.to_lowercase()
}

/// Desired entries keyed by folded identifier; the first occurrence wins
fn desired_map(desired: &[DesiredEntry]) -> BTreeMap<String, &DesiredEntry> {
    let mut map = BTreeMap::new();
    for entry in desired {
        map.entry(fold(&entry.identifier)).or_insert(entry);
    }
    map
}

/// Compute the operations moving `remote` to `desired`
///
/// Granular output is all adds then all removes, each sorted by identifier.
/// Replace output is at most one `Replace` with entries sorted by identifier.
pub fn diff(desired: &[DesiredEntry], remote: &[RemoteEntry], mode: DiffMode) -> Vec<Operation> {
    let desired = desired_map(desired);
    let remote: BTreeMap<String, &RemoteEntry> =
        remote.iter().map(|e| (fold(&e.id), e)).collect();

    match mode {
        DiffMode::Replace => {
            let converged = desired.len() == remote.len()
                && desired.iter().all(|(key, want)| {
                    remote
                        .get(key)
                        .is_some_and(|have| have.active == want.active)
                });
            if converged {
                Vec::new()
            } else {
                let mut entries: Vec<DesiredEntry> =
                    desired.values().map(|e| (*e).clone()).collect();
                entries.sort();
                vec![Operation::Replace(entries)]
            }
        }
        DiffMode::Granular => {
            let mut adds: Vec<Operation> = desired
                .iter()
                .filter(|(key, want)| {
                    remote
                        .get(*key)
                        .map_or(true, |have| have.active != want.active)
                })
                .map(|(_, want)| Operation::add(&want.identifier, want.active))
                .collect();
            adds.sort_by(|a, b| op_identifier(a).cmp(op_identifier(b)));

            let mut removes: Vec<Operation> = remote
                .iter()
                .filter(|(key, _)| !desired.contains_key(*key))
                .map(|(_, have)| Operation::remove(&have.id))
                .collect();
            removes.sort_by(|a, b| op_identifier(a).cmp(op_identifier(b)));

            adds.extend(removes);
            adds
        }
    }
}

fn op_identifier(op: &Operation) -> &str {
    match op {
        Operation::Add { identifier, .. } | Operation::Remove { identifier } => identifier,
        Operation::Replace(_) => "",
    }
}

/// Diff for ID-only collections (TLDs, privacy blocklists and natives)
///
/// Returns the sorted replacement, or `None` when converged.
pub fn diff_ids(desired: &[String], remote: &[String]) -> Option<Vec<String>> {
    let desired: Vec<DesiredEntry> = desired.iter().map(DesiredEntry::active).collect();
    let remote: Vec<RemoteEntry> = remote.iter().map(|id| RemoteEntry::new(id, true)).collect();

    diff(&desired, &remote, DiffMode::Replace)
        .into_iter()
        .find_map(|op| match op {
            Operation::Replace(entries) => {
                Some(entries.into_iter().map(|e| e.identifier).collect())
            }
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired(ids: &[&str]) -> Vec<DesiredEntry> {
        ids.iter().map(|id| DesiredEntry::active(*id)).collect()
    }

    fn remote(ids: &[&str]) -> Vec<RemoteEntry> {
        ids.iter().map(|id| RemoteEntry::new(*id, true)).collect()
    }

    #[test]
    fn test_granular_is_minimal() {
        let ops = diff(&desired(&["a", "b"]), &remote(&["b", "c"]), DiffMode::Granular);
        assert_eq!(ops, vec![Operation::add("a", true), Operation::remove("c")]);
    }

    #[test]
    fn test_granular_adds_then_removes_sorted() {
        let ops = diff(
            &desired(&["z", "m", "a"]),
            &remote(&["y", "b"]),
            DiffMode::Granular,
        );
        assert_eq!(
            ops,
            vec![
                Operation::add("a", true),
                Operation::add("m", true),
                Operation::add("z", true),
                Operation::remove("b"),
                Operation::remove("y"),
            ]
        );
    }

    #[test]
    fn test_active_flag_mismatch_upserts() {
        let remote = vec![RemoteEntry::new("a", false)];
        let ops = diff(&desired(&["a"]), &remote, DiffMode::Granular);
        assert_eq!(ops, vec![Operation::add("a", true)]);
    }

    #[test]
    fn test_converged_emits_nothing() {
        for mode in [DiffMode::Granular, DiffMode::Replace] {
            assert!(diff(&desired(&["A.com", "b.com"]), &remote(&["b.com", "a.com"]), mode).is_empty());
        }
    }

    #[test]
    fn test_empty_desired_removes_everything() {
        let ops = diff(&[], &remote(&["a", "b"]), DiffMode::Granular);
        assert_eq!(ops, vec![Operation::remove("a"), Operation::remove("b")]);

        let ops = diff(&[], &remote(&["a"]), DiffMode::Replace);
        assert_eq!(ops, vec![Operation::Replace(Vec::new())]);
    }

    #[test]
    fn test_replace_is_deterministic() {
        let first = diff(&desired(&["c", "a", "b"]), &remote(&["x"]), DiffMode::Replace);
        let second = diff(&desired(&["b", "c", "a"]), &remote(&["x"]), DiffMode::Replace);

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![Operation::Replace(desired(&["a", "b", "c"]))]
        );
    }

    #[test]
    fn test_diff_ids() {
        assert_eq!(
            diff_ids(&["zip".to_string(), "mov".to_string()], &["mov".to_string()]),
            Some(vec!["mov".to_string(), "zip".to_string()])
        );
        assert_eq!(diff_ids(&["zip".to_string()], &["ZIP".to_string()]), None);
    }
}
