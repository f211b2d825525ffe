//! Integration tests for nextdns-operator
//!
//! These tests drive the full reconcile path from declared resources in the
//! store to calls against the recording policy API.

use nextdns_operator::api::{ApiError, DomainList, FakeProfile, InMemoryPolicyApi, RemoteEntry};
use nextdns_operator::controller::{Controller, ControllerCommand, ControllerConfig};
use nextdns_operator::manifest::{ManifestSet, ManifestSource};
use nextdns_operator::reconcile::{
    Action, DiffMode, ReconcileKey, ReconcileOutcome, Reconciler, ReconcilerConfig,
};
use nextdns_operator::resources::{
    find_condition, Collection, DeletionPolicy, ListEntry, ListKind, ObjectMeta, Phase, Profile,
    ProfileSpec, ResourceKey, ResourceRef, SharedList, SharedListSpec, REFERENCES_RESOLVED,
};
use nextdns_operator::store::{InMemoryStore, ResourceStore, WatchEvent};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const NS: &str = "home";

struct Harness {
    store: Arc<InMemoryStore>,
    api: InMemoryPolicyApi,
    reconciler: Arc<Reconciler>,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(ReconcilerConfig::default()).await
    }

    async fn with_config(config: ReconcilerConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let mut data = BTreeMap::new();
        data.insert("apiKey".to_string(), "test-key".to_string());
        store.apply_secret(ResourceKey::new(NS, "creds"), data).await;

        let api = InMemoryPolicyApi::new();
        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            store.clone(),
            Arc::new(api.clone()),
            config,
        ));
        Self {
            store,
            api,
            reconciler,
        }
    }

    async fn apply_profile(&self, name: &str, spec: ProfileSpec) -> Profile {
        self.store
            .apply_profile(Profile::new(ObjectMeta::new(NS, name), spec))
            .await
            .unwrap()
    }

    async fn apply_list(&self, kind: ListKind, name: &str, entries: Vec<ListEntry>) -> SharedList {
        self.store
            .apply_list(SharedList::new(
                kind,
                ObjectMeta::new(NS, name),
                SharedListSpec {
                    description: None,
                    entries,
                },
            ))
            .await
    }

    async fn reconcile(&self, name: &str) -> Action {
        self.reconciler
            .reconcile(&ReconcileKey::Profile(ResourceKey::new(NS, name)))
            .await
    }

    async fn profile(&self, name: &str) -> Profile {
        self.store
            .get_profile(&ResourceKey::new(NS, name))
            .await
            .unwrap()
    }

    async fn remote_id(&self, name: &str) -> String {
        self.profile(name)
            .await
            .status
            .and_then(|s| s.profile_id)
            .unwrap()
    }

    async fn remote_list(&self, name: &str, list: DomainList) -> Vec<String> {
        let id = self.remote_id(name).await;
        let remote = self.api.profile(&id).await.unwrap();
        let mut ids: Vec<String> = remote
            .list(list)
            .iter()
            .filter(|e| e.active)
            .map(|e| e.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

fn spec() -> ProfileSpec {
    ProfileSpec::new("Kids", "creds")
}

fn entries(values: &[&str]) -> Vec<ListEntry> {
    values.iter().map(|v| ListEntry::new(*v)).collect()
}

mod convergence_tests {
    use super::*;

    #[tokio::test]
    async fn test_second_pass_makes_no_mutations() {
        let h = Harness::new().await;
        h.apply_list(ListKind::Denylist, "social", entries(&["tiktok.com", "instagram.com"]))
            .await;
        let mut spec = spec();
        spec.denylist_refs.push(ResourceRef::new("social"));
        spec.allowlist.push(ListEntry::new("school.example"));
        spec.security = Some(Default::default());
        h.apply_profile("kids", spec).await;

        h.reconcile("kids").await;
        assert!(!h.api.mutations().await.is_empty());

        h.api.clear_calls().await;
        let action = h.reconcile("kids").await;

        assert_eq!(action, Action::Requeue(h.reconciler.config().resync_interval));
        assert!(h.api.mutations().await.is_empty());
        assert_eq!(h.profile("kids").await.status.unwrap().phase, Phase::Ready);
    }

    #[tokio::test]
    async fn test_shared_and_inline_entries_merge() {
        let h = Harness::new().await;
        h.apply_list(ListKind::Denylist, "l1", entries(&["a.com", "b.com"])).await;
        h.apply_list(ListKind::Denylist, "l2", entries(&["c.com", "B.com"])).await;
        let mut spec = spec();
        spec.denylist_refs = vec![ResourceRef::new("l1"), ResourceRef::new("l2")];
        spec.denylist = entries(&["d.com", "a.com"]);
        h.apply_profile("kids", spec).await;

        h.reconcile("kids").await;

        assert_eq!(
            h.remote_list("kids", DomainList::Denylist).await,
            vec!["a.com", "b.com", "c.com", "d.com"]
        );
        let status = h.profile("kids").await.status.unwrap();
        assert_eq!(status.counts.denylist, 4);
        assert_eq!(status.references.len(), 2);
    }

    #[tokio::test]
    async fn test_inactive_entry_removes_identifier_in_any_order() {
        let h = Harness::new().await;
        h.apply_list(
            ListKind::Denylist,
            "shared-off",
            vec![ListEntry::inactive("x.com"), ListEntry::new("keep.com")],
        )
        .await;
        h.apply_list(ListKind::Denylist, "shared-on", entries(&["y.com"])).await;

        let mut inline_on = spec();
        inline_on.denylist_refs.push(ResourceRef::new("shared-off"));
        inline_on.denylist = entries(&["x.com"]);
        h.apply_profile("first", inline_on).await;

        let mut inline_off = spec();
        inline_off.denylist_refs.push(ResourceRef::new("shared-on"));
        inline_off.denylist = vec![ListEntry::inactive("Y.com")];
        h.apply_profile("second", inline_off).await;

        h.reconcile("first").await;
        h.reconcile("second").await;

        assert_eq!(h.remote_list("first", DomainList::Denylist).await, vec!["keep.com"]);
        assert!(h.remote_list("second", DomainList::Denylist).await.is_empty());
    }

    #[tokio::test]
    async fn test_list_edit_issues_minimal_calls() {
        let h = Harness::new().await;
        h.apply_list(ListKind::Denylist, "social", entries(&["a.com", "b.com", "c.com"]))
            .await;
        let mut spec = spec();
        spec.denylist_refs.push(ResourceRef::new("social"));
        h.apply_profile("kids", spec).await;
        h.reconcile("kids").await;

        h.apply_list(ListKind::Denylist, "social", entries(&["b.com", "c.com", "e.com"]))
            .await;
        h.api.clear_calls().await;
        h.reconcile("kids").await;

        let mutations: Vec<(String, String)> = h
            .api
            .mutations()
            .await
            .into_iter()
            .map(|c| (c.op.to_string(), c.detail.unwrap_or_default()))
            .collect();
        assert_eq!(
            mutations,
            vec![
                ("add_domain_entry".to_string(), "denylist:e.com".to_string()),
                ("delete_domain_entry".to_string(), "denylist:a.com".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_mode_issues_one_sorted_call() {
        let h = Harness::with_config(ReconcilerConfig {
            list_sync_mode: DiffMode::Replace,
            ..ReconcilerConfig::default()
        })
        .await;
        let mut spec = spec();
        spec.denylist = entries(&["c.com", "a.com", "b.com"]);
        h.apply_profile("kids", spec).await;

        h.reconcile("kids").await;

        let syncs: Vec<String> = h
            .api
            .mutations()
            .await
            .into_iter()
            .filter(|c| c.op == "sync_domain_list")
            .filter_map(|c| c.detail)
            .collect();
        assert_eq!(syncs, vec!["denylist:a.com,b.com,c.com".to_string()]);

        h.api.clear_calls().await;
        h.reconcile("kids").await;
        assert!(h.api.mutations().await.is_empty());
    }

    #[tokio::test]
    async fn test_remote_drift_is_reverted() {
        let h = Harness::new().await;
        let mut spec = spec();
        spec.denylist = entries(&["a.com"]);
        h.apply_profile("kids", spec).await;
        h.reconcile("kids").await;

        let id = h.remote_id("kids").await;
        let mut remote = h.api.profile(&id).await.unwrap();
        remote.denylist.push(RemoteEntry::new("manual.com", true));
        h.api.insert_profile(&id, remote).await;

        h.reconcile("kids").await;
        assert_eq!(h.remote_list("kids", DomainList::Denylist).await, vec!["a.com"]);
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_reference_leaves_remote_untouched() {
        let h = Harness::new().await;
        h.api.insert_profile("abc123", FakeProfile::default()).await;
        let mut spec = spec();
        spec.profile_id = Some("abc123".into());
        spec.denylist_refs.push(ResourceRef::new("ghost"));
        h.apply_profile("kids", spec).await;

        let action = h.reconcile("kids").await;

        assert!(matches!(action, Action::Requeue(_)));
        assert!(h.api.calls().await.is_empty());
        let status = h.profile("kids").await.status.unwrap();
        assert_eq!(status.phase, Phase::Error);
        let missing = status
            .references
            .iter()
            .find(|r| r.name == "ghost")
            .unwrap();
        assert!(!missing.ready);
        assert!(!find_condition(&status.conditions, REFERENCES_RESOLVED)
            .unwrap()
            .is_true());
    }

    #[tokio::test]
    async fn test_reference_created_later_resolves() {
        let h = Harness::new().await;
        let mut spec = spec();
        spec.allowlist_refs.push(ResourceRef::new("school"));
        h.apply_profile("kids", spec).await;
        h.reconcile("kids").await;
        assert_eq!(h.profile("kids").await.status.unwrap().phase, Phase::Error);

        h.apply_list(ListKind::Allowlist, "school", entries(&["school.example"]))
            .await;
        h.reconcile("kids").await;

        assert_eq!(h.profile("kids").await.status.unwrap().phase, Phase::Ready);
        assert_eq!(
            h.remote_list("kids", DomainList::Allowlist).await,
            vec!["school.example"]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_syncs_remaining_collections() {
        let h = Harness::new().await;
        let mut spec = spec();
        spec.denylist = entries(&["bad.com"]);
        spec.allowlist = entries(&["good.com"]);
        h.apply_profile("kids", spec).await;
        // the denylist syncs first and takes the only injected failure
        h.api
            .fail_on("add_domain_entry", ApiError::Transient("503".into()), 1)
            .await;

        let action = h.reconcile("kids").await;

        assert!(matches!(action, Action::Requeue(_)));
        assert_eq!(h.remote_list("kids", DomainList::Allowlist).await, vec!["good.com"]);
        assert!(h.remote_list("kids", DomainList::Denylist).await.is_empty());

        let status = h.profile("kids").await.status.unwrap();
        assert_eq!(status.phase, Phase::Error);
        let synced = |collection: Collection| {
            status
                .collections
                .iter()
                .find(|c| c.collection == collection)
                .map(|c| c.synced)
        };
        assert_eq!(synced(Collection::Denylist), Some(false));
        assert_eq!(synced(Collection::Allowlist), Some(true));
        assert_eq!(status.counts.allowlist, 1);
        assert_eq!(status.counts.denylist, 0);

        h.reconcile("kids").await;
        assert_eq!(h.remote_list("kids", DomainList::Denylist).await, vec!["bad.com"]);
        assert_eq!(h.profile("kids").await.status.unwrap().phase, Phase::Ready);
    }
}

mod deletion_tests {
    use super::*;

    #[tokio::test]
    async fn test_deletion_removes_remote_profile_once() {
        let h = Harness::new().await;
        h.apply_profile("kids", spec()).await;
        h.reconcile("kids").await;
        let id = h.remote_id("kids").await;

        let key = ResourceKey::new(NS, "kids");
        h.store.delete_profile(&key).await.unwrap();
        h.api.clear_calls().await;

        let outcome = h
            .reconciler
            .run(&ReconcileKey::Profile(key.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Deleted);
        let deletes: Vec<_> = h
            .api
            .mutations()
            .await
            .into_iter()
            .filter(|c| c.op == "delete_profile")
            .collect();
        assert_eq!(deletes.len(), 1);
        assert_eq!(deletes[0].profile_id.as_deref(), Some(id.as_str()));
        assert!(h.store.get_profile(&key).await.is_err());

        let again = h.reconciler.run(&ReconcileKey::Profile(key)).await.unwrap();
        assert_eq!(again, ReconcileOutcome::Gone);
    }

    #[tokio::test]
    async fn test_remote_already_gone_still_releases_finalizer() {
        let h = Harness::new().await;
        h.apply_profile("kids", spec()).await;
        h.reconcile("kids").await;
        let id = h.remote_id("kids").await;
        nextdns_operator::api::PolicyApi::delete_profile(&h.api, &id)
            .await
            .unwrap();

        let key = ResourceKey::new(NS, "kids");
        h.store.delete_profile(&key).await.unwrap();
        let action = h.reconcile("kids").await;

        assert_eq!(action, Action::AwaitChange);
        assert!(h.store.get_profile(&key).await.is_err());
    }

    #[tokio::test]
    async fn test_orphan_policy_keeps_remote_profile() {
        let h = Harness::new().await;
        let mut spec = spec();
        spec.deletion_policy = DeletionPolicy::Orphan;
        h.apply_profile("kids", spec).await;
        h.reconcile("kids").await;
        let id = h.remote_id("kids").await;

        let key = ResourceKey::new(NS, "kids");
        h.store.delete_profile(&key).await.unwrap();
        h.reconcile("kids").await;

        assert!(h.store.get_profile(&key).await.is_err());
        assert_eq!(h.api.profile_ids().await, vec![id]);
    }
}

mod dependency_tests {
    use super::*;

    fn controller(h: &Harness) -> Controller {
        Controller::new(Arc::clone(&h.reconciler), ControllerConfig::default())
    }

    #[tokio::test]
    async fn test_list_change_triggers_only_referencing_profiles() {
        let h = Harness::new().await;
        h.apply_list(ListKind::Denylist, "ads", entries(&["ads.example"])).await;
        for name in ["p1", "p2"] {
            let mut spec = spec();
            spec.denylist_refs.push(ResourceRef::new("ads"));
            h.apply_profile(name, spec).await;
        }
        h.apply_profile("p3", spec()).await;

        let controller = controller(&h);
        controller.resync_all().await.unwrap();
        while !controller.queue().is_empty() {
            let key = controller.queue().next().await.unwrap();
            controller.queue().done(&key);
        }

        let list = h
            .apply_list(ListKind::Denylist, "ads", entries(&["ads.example", "track.example"]))
            .await;
        controller.dispatch(&WatchEvent::ListApplied(list)).await;

        let profiles: Vec<ReconcileKey> = controller
            .queue()
            .pending()
            .into_iter()
            .filter(|k| matches!(k, ReconcileKey::Profile(_)))
            .collect();
        assert_eq!(
            profiles,
            vec![
                ReconcileKey::Profile(ResourceKey::new(NS, "p1")),
                ReconcileKey::Profile(ResourceKey::new(NS, "p2")),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_status_reports_referencing_profiles() {
        let h = Harness::new().await;
        h.apply_list(ListKind::TldList, "risky", entries(&["zip", ".ZIP", "mov"]))
            .await;
        let mut spec = spec();
        spec.tld_list_refs.push(ResourceRef::new("risky"));
        h.apply_profile("kids", spec).await;

        let outcome = h
            .reconciler
            .run(&ReconcileKey::List(ListKind::TldList, ResourceKey::new(NS, "risky")))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::ListObserved { active_count: 2 });
        let list = h
            .store
            .get_list(ListKind::TldList, &ResourceKey::new(NS, "risky"))
            .await
            .unwrap();
        let status = list.status.unwrap();
        assert_eq!(status.profile_refs.len(), 1);
        assert_eq!(status.profile_refs[0].name, "kids");
    }

    #[tokio::test]
    async fn test_controller_propagates_list_edit() {
        let h = Harness::new().await;
        h.apply_list(ListKind::Denylist, "ads", entries(&["ads.example"])).await;
        let mut spec = spec();
        spec.denylist_refs.push(ResourceRef::new("ads"));
        h.apply_profile("kids", spec).await;

        let mut controller = Controller::new(
            Arc::clone(&h.reconciler),
            ControllerConfig::default().with_workers(2),
        );
        let commands = controller.command_sender();
        let handle = tokio::spawn(async move { controller.run().await });

        let harness = &h;
        wait_for(move || async move {
            harness.profile("kids").await.status.map(|s| s.phase) == Some(Phase::Ready)
        })
        .await;

        h.apply_list(ListKind::Denylist, "ads", entries(&["ads.example", "track.example"]))
            .await;
        wait_for(move || async move {
            harness.remote_list("kids", DomainList::Denylist).await
                == vec!["ads.example", "track.example"]
        })
        .await;

        commands.send(ControllerCommand::Shutdown).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    async fn wait_for<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within 5s");
    }
}

mod manifest_tests {
    use super::*;

    const MANIFESTS: &str = r#"
kind: Secret
metadata:
  name: creds
  namespace: home
stringData:
  apiKey: test-key
---
kind: Denylist
metadata:
  name: social
  namespace: home
spec:
  entries:
    - domain: tiktok.com
---
kind: Profile
metadata:
  name: kids
  namespace: home
spec:
  name: Kids
  credentialsRef:
    name: creds
  denylistRefs:
    - name: social
  denylist:
    - domain: reddit.com
"#;

    #[tokio::test]
    async fn test_manifest_directory_to_remote() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kids.yaml"), MANIFESTS).unwrap();

        let h = Harness::new().await;
        let source = ManifestSource::new(dir.path(), Arc::clone(&h.store));
        source.sync_once().await.unwrap();

        assert_eq!(h.reconcile("kids").await, Action::Requeue(h.reconciler.config().resync_interval));
        assert_eq!(
            h.remote_list("kids", DomainList::Denylist).await,
            vec!["reddit.com", "tiktok.com"]
        );
    }

    #[test]
    fn test_manifest_set_round_trip_keys() {
        let set = ManifestSet::parse_str(MANIFESTS, "kids.yaml").unwrap();
        assert!(set.profile(&ResourceKey::new(NS, "kids")).is_some());
        assert_eq!(set.lists[0].kind, ListKind::Denylist);
        assert_eq!(set.secrets[0].0, ResourceKey::new(NS, "creds"));
    }
}
