//! Manifest directory source
//!
//! Applies a directory of manifests to an [`InMemoryStore`] and removes
//! objects that are no longer declared. Deleting a profile this way goes
//! through its finalizer like any other deletion.

use super::parser::ManifestSet;
use crate::resources::{ListKind, ResourceKey};
use crate::store::{InMemoryStore, ResourceStore};
use crate::Result;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of one pass over the manifest directory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSyncReport {
    /// Objects declared and applied
    pub applied: usize,
    /// Objects removed because they are no longer declared
    pub deleted: usize,
}

pub struct ManifestSource {
    dir: PathBuf,
    store: Arc<InMemoryStore>,
}

impl ManifestSource {
    pub fn new(dir: impl Into<PathBuf>, store: Arc<InMemoryStore>) -> Self {
        Self {
            dir: dir.into(),
            store,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the directory and converge the store onto it
    ///
    /// Secrets and lists are applied before profiles so a new profile finds
    /// its references on the first reconcile.
    pub async fn sync_once(&self) -> Result<ManifestSyncReport> {
        let set = ManifestSet::load_dir(&self.dir)?;
        self.apply(set).await
    }

    /// Converge the store onto an already loaded set
    pub async fn apply(&self, set: ManifestSet) -> Result<ManifestSyncReport> {
        let mut report = ManifestSyncReport::default();

        let secret_keys: HashSet<ResourceKey> = set.secrets.iter().map(|(k, _)| k.clone()).collect();
        for (key, data) in set.secrets {
            self.store.apply_secret(key, data).await;
            report.applied += 1;
        }

        let list_keys: HashSet<(ListKind, ResourceKey)> = set
            .lists
            .iter()
            .map(|l| (l.kind, l.metadata.key()))
            .collect();
        for list in set.lists {
            self.store.apply_list(list).await;
            report.applied += 1;
        }

        let profile_keys: HashSet<ResourceKey> =
            set.profiles.iter().map(|p| p.metadata.key()).collect();
        for profile in set.profiles {
            self.store.apply_profile(profile).await?;
            report.applied += 1;
        }

        for profile in self.store.list_profiles(None).await? {
            let key = profile.metadata.key();
            if profile_keys.contains(&key) || profile.metadata.is_deleting() {
                continue;
            }
            if self.store.delete_profile(&key).await? {
                tracing::info!(profile = %key, "Profile removed from manifests");
                report.deleted += 1;
            }
        }

        for kind in ListKind::ALL {
            for list in self.store.list_lists(kind, None).await? {
                let key = list.metadata.key();
                if list_keys.contains(&(kind, key.clone())) {
                    continue;
                }
                if self.store.delete_list(kind, &key).await {
                    tracing::info!(kind = %kind, list = %key, "Shared list removed from manifests");
                    report.deleted += 1;
                }
            }
        }

        for key in self.store.secret_keys().await {
            if !secret_keys.contains(&key) && self.store.delete_secret(&key).await {
                tracing::info!(secret = %key, "Secret removed from manifests");
                report.deleted += 1;
            }
        }

        Ok(report)
    }

    /// Re-apply the directory every `interval` until `shutdown` flips to true
    ///
    /// A broken manifest is logged and skipped; the store keeps the last
    /// good state until the files are fixed.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sync_once().await {
                        Ok(report) if report.deleted > 0 => {
                            tracing::debug!(applied = report.applied, deleted = report.deleted, "Manifests synced");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(dir = %self.dir.display(), error = %e, "Failed to load manifests");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Manifest source stopping");
                        break;
                    }
                }
            }
        }
    }
}
