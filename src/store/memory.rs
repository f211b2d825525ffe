//! In-memory resource store
//!
//! Holds profiles, shared lists and secrets with the same write semantics a
//! declarative API server gives: generations move only on spec changes,
//! resource versions move on every write, status writes are checked for
//! staleness, and objects with finalizers are only marked for deletion.

use super::{
    CredentialLookup, ResourceStore, StateFile, StoreError, StoreResult, WatchEvent,
};
use crate::resources::{ListKind, Profile, ResourceKey, SharedList};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::{broadcast, RwLock};

/// Watch channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct StoreState {
    profiles: BTreeMap<ResourceKey, Profile>,
    lists: BTreeMap<(ListKind, ResourceKey), SharedList>,
    secrets: BTreeMap<ResourceKey, BTreeMap<String, String>>,
    next_version: u64,
}

impl StoreState {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// Store backed by process memory and an optional state file
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<WatchEvent>,
    state_file: Option<StateFile>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store without persistence
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            events,
            state_file: None,
        }
    }

    /// Create a store that restores and persists profiles through `file`
    pub fn with_state_file(file: StateFile) -> crate::Result<Self> {
        let profiles = file.load()?;
        let mut state = StoreState::default();
        for profile in profiles {
            state.next_version = state.next_version.max(profile.metadata.resource_version);
            state.profiles.insert(profile.metadata.key(), profile);
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            state: RwLock::new(state),
            events,
            state_file: Some(file),
        })
    }

    fn emit(&self, event: WatchEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Watch event sent but no receivers subscribed");
        }
    }

    fn persist(&self, state: &StoreState) -> StoreResult<()> {
        if let Some(ref file) = self.state_file {
            let profiles: Vec<Profile> = state.profiles.values().cloned().collect();
            file.save(&profiles)
                .map_err(|e| StoreError::Unavailable(format!("failed to write state file: {}", e)))?;
        }
        Ok(())
    }

    /// Create or update a profile spec
    ///
    /// Metadata other than the identity, and the status, stay owned by the
    /// store. Spec changes on an object being deleted are ignored.
    pub async fn apply_profile(&self, profile: Profile) -> StoreResult<Profile> {
        let key = profile.metadata.key();
        let mut state = self.state.write().await;

        let stored = match state.profiles.get(&key).cloned() {
            Some(existing) if existing.metadata.is_deleting() => {
                tracing::debug!(profile = %key, "Ignoring spec update for profile being deleted");
                return Ok(existing);
            }
            Some(existing) if existing.spec == profile.spec => return Ok(existing),
            Some(mut existing) => {
                existing.spec = profile.spec;
                existing.metadata.generation += 1;
                existing.metadata.resource_version = state.bump();
                existing
            }
            None => {
                let mut created = profile;
                created.metadata.generation = 1;
                created.metadata.resource_version = state.bump();
                created.metadata.deletion_timestamp = None;
                created.status = None;
                created
            }
        };

        state.profiles.insert(key, stored.clone());
        self.persist(&state)?;
        drop(state);

        self.emit(WatchEvent::ProfileApplied(stored.clone()));
        Ok(stored)
    }

    /// Request deletion of a profile
    ///
    /// Objects with finalizers get a deletion timestamp; others are removed.
    /// Returns false if the profile did not exist.
    pub async fn delete_profile(&self, key: &ResourceKey) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let Some(mut profile) = state.profiles.get(key).cloned() else {
            return Ok(false);
        };

        if profile.metadata.finalizers.is_empty() {
            state.profiles.remove(key);
            self.persist(&state)?;
            drop(state);
            self.emit(WatchEvent::ProfileDeleted(profile));
            return Ok(true);
        }

        if profile.metadata.deletion_timestamp.is_none() {
            profile.metadata.deletion_timestamp = Some(Utc::now());
            profile.metadata.resource_version = state.bump();
            state.profiles.insert(key.clone(), profile.clone());
            self.persist(&state)?;
            drop(state);
            self.emit(WatchEvent::ProfileApplied(profile));
        }
        Ok(true)
    }

    /// Create or update a shared list spec
    pub async fn apply_list(&self, list: SharedList) -> SharedList {
        let key = (list.kind, list.metadata.key());
        let mut state = self.state.write().await;

        let stored = match state.lists.get(&key).cloned() {
            Some(existing) if existing.spec == list.spec => return existing,
            Some(mut existing) => {
                existing.spec = list.spec;
                existing.metadata.generation += 1;
                existing.metadata.resource_version = state.bump();
                existing
            }
            None => {
                let mut created = list;
                created.metadata.generation = 1;
                created.metadata.resource_version = state.bump();
                created.status = None;
                created
            }
        };

        state.lists.insert(key, stored.clone());
        drop(state);

        self.emit(WatchEvent::ListApplied(stored.clone()));
        stored
    }

    /// Remove a shared list; returns false if it did not exist
    pub async fn delete_list(&self, kind: ListKind, key: &ResourceKey) -> bool {
        let removed = self.state.write().await.lists.remove(&(kind, key.clone()));
        match removed {
            Some(list) => {
                self.emit(WatchEvent::ListDeleted(list));
                true
            }
            None => false,
        }
    }

    /// Create or replace a secret
    pub async fn apply_secret(&self, key: ResourceKey, data: BTreeMap<String, String>) {
        let mut state = self.state.write().await;
        if state.secrets.get(&key) == Some(&data) {
            return;
        }
        state.secrets.insert(key.clone(), data);
        drop(state);

        self.emit(WatchEvent::SecretApplied(key));
    }

    /// Remove a secret; returns false if it did not exist
    pub async fn delete_secret(&self, key: &ResourceKey) -> bool {
        let removed = self.state.write().await.secrets.remove(key).is_some();
        if removed {
            self.emit(WatchEvent::SecretDeleted(key.clone()));
        }
        removed
    }

    /// Keys of every stored secret
    pub async fn secret_keys(&self) -> Vec<ResourceKey> {
        self.state.read().await.secrets.keys().cloned().collect()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_profile(&self, key: &ResourceKey) -> StoreResult<Profile> {
        self.state
            .read()
            .await
            .profiles
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Profile", key))
    }

    async fn list_profiles(&self, namespace: Option<&str>) -> StoreResult<Vec<Profile>> {
        Ok(self
            .state
            .read()
            .await
            .profiles
            .values()
            .filter(|p| namespace.map_or(true, |ns| p.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    async fn update_profile_status(&self, profile: &Profile) -> StoreResult<Profile> {
        let key = profile.metadata.key();
        let mut state = self.state.write().await;

        let current_version = state
            .profiles
            .get(&key)
            .ok_or_else(|| StoreError::not_found("Profile", &key))?
            .metadata
            .resource_version;
        if current_version != profile.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "Profile".to_string(),
                key: key.to_string(),
                expected: profile.metadata.resource_version,
                actual: current_version,
            });
        }

        let version = state.bump();
        let updated = match state.profiles.get_mut(&key) {
            Some(stored) => {
                stored.status = profile.status.clone();
                stored.metadata.resource_version = version;
                stored.clone()
            }
            None => return Err(StoreError::not_found("Profile", &key)),
        };
        self.persist(&state)?;
        drop(state);

        self.emit(WatchEvent::ProfileApplied(updated.clone()));
        Ok(updated)
    }

    async fn update_profile_finalizers(&self, profile: &Profile) -> StoreResult<Option<Profile>> {
        let key = profile.metadata.key();
        let mut state = self.state.write().await;

        let mut stored = state
            .profiles
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Profile", &key))?;
        if stored.metadata.resource_version != profile.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "Profile".to_string(),
                key: key.to_string(),
                expected: profile.metadata.resource_version,
                actual: stored.metadata.resource_version,
            });
        }

        stored.metadata.finalizers = profile.metadata.finalizers.clone();

        if stored.metadata.is_deleting() && stored.metadata.finalizers.is_empty() {
            state.profiles.remove(&key);
            self.persist(&state)?;
            drop(state);
            self.emit(WatchEvent::ProfileDeleted(stored));
            return Ok(None);
        }

        stored.metadata.resource_version = state.bump();
        state.profiles.insert(key, stored.clone());
        self.persist(&state)?;
        drop(state);

        self.emit(WatchEvent::ProfileApplied(stored.clone()));
        Ok(Some(stored))
    }

    async fn get_list(&self, kind: ListKind, key: &ResourceKey) -> StoreResult<SharedList> {
        self.state
            .read()
            .await
            .lists
            .get(&(kind, key.clone()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind.as_str(), key))
    }

    async fn list_lists(
        &self,
        kind: ListKind,
        namespace: Option<&str>,
    ) -> StoreResult<Vec<SharedList>> {
        Ok(self
            .state
            .read()
            .await
            .lists
            .values()
            .filter(|l| l.kind == kind)
            .filter(|l| namespace.map_or(true, |ns| l.metadata.namespace == ns))
            .cloned()
            .collect())
    }

    async fn update_list_status(&self, list: &SharedList) -> StoreResult<SharedList> {
        let key = (list.kind, list.metadata.key());
        let mut state = self.state.write().await;

        let current_version = state
            .lists
            .get(&key)
            .ok_or_else(|| StoreError::not_found(list.kind.as_str(), &key.1))?
            .metadata
            .resource_version;
        if current_version != list.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: list.kind.as_str().to_string(),
                key: key.1.to_string(),
                expected: list.metadata.resource_version,
                actual: current_version,
            });
        }

        let version = state.bump();
        let updated = match state.lists.get_mut(&key) {
            Some(stored) => {
                stored.status = list.status.clone();
                stored.metadata.resource_version = version;
                stored.clone()
            }
            None => return Err(StoreError::not_found(list.kind.as_str(), &key.1)),
        };
        drop(state);

        self.emit(WatchEvent::ListApplied(updated.clone()));
        Ok(updated)
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl CredentialLookup for InMemoryStore {
    async fn get_secret_value(&self, namespace: &str, name: &str, key: &str) -> StoreResult<String> {
        let secret_key = ResourceKey::new(namespace, name);
        let state = self.state.read().await;
        let data = state
            .secrets
            .get(&secret_key)
            .ok_or_else(|| StoreError::not_found("Secret", &secret_key))?;
        data.get(key)
            .cloned()
            .ok_or_else(|| StoreError::not_found("Secret key", format!("{}[{}]", secret_key, key)))
    }
}
