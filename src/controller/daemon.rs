//! Controller daemon
//!
//! Watches the resource store, filters change events down to the keys that
//! need work and feeds them to a pool of reconcile workers. Runs as a tokio
//! event loop with a periodic full resync.

use super::queue::WorkQueue;
use crate::metrics;
use crate::reconcile::dependents::targets_of;
use crate::reconcile::{find_dependents, Action, DependencyTarget, ReconcileKey, Reconciler};
use crate::resources::{ListKind, Profile, ResourceKey};
use crate::store::WatchEvent;
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default full resync interval (5 minutes)
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Default event channel capacity (1000 events)
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Keys reconciled concurrently
    pub workers: usize,

    /// Interval of the periodic full resync
    pub resync_interval: Duration,

    /// Only handle this namespace; all namespaces when `None`
    pub namespace: Option<String>,

    /// Event broadcast channel capacity
    pub event_channel_capacity: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            namespace: None,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl ControllerConfig {
    /// Set the worker count
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the resync interval
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Restrict the controller to one namespace
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }
}

/// Events emitted by the controller
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Controller started
    Started,

    /// Controller stopped
    Stopped,

    /// Full resync enqueued every known key
    ResyncStarted {
        /// Number of keys enqueued
        keys: usize,
    },

    /// One reconcile finished
    Reconciled {
        key: ReconcileKey,
        action: Action,
    },

    /// Error occurred outside a reconcile
    Error {
        /// Error message
        message: String,
    },
}

/// Commands that can be sent to the controller
#[derive(Debug, Clone)]
pub enum ControllerCommand {
    /// Enqueue every known key now
    ResyncAll,

    /// Stop the controller
    Shutdown,
}

/// Result of handling a command
enum CommandResult {
    /// Continue running the controller
    Continue,
    /// Stop the controller
    Stop,
}

/// Last observed state of a profile, for event filtering
#[derive(Debug, Clone, PartialEq)]
struct ObservedProfile {
    generation: i64,
    deleting: bool,
    targets: BTreeSet<DependencyTarget>,
}

impl ObservedProfile {
    fn of(profile: &Profile) -> Self {
        Self {
            generation: profile.metadata.generation,
            deleting: profile.metadata.is_deleting(),
            targets: targets_of(profile),
        }
    }
}

#[derive(Debug, Default)]
struct Observed {
    profiles: HashMap<ResourceKey, ObservedProfile>,
    lists: HashMap<(ListKind, ResourceKey), i64>,
}

fn list_keys(targets: &BTreeSet<DependencyTarget>) -> impl Iterator<Item = ReconcileKey> + '_ {
    targets.iter().filter_map(|t| match t {
        DependencyTarget::List(kind, key) => Some(ReconcileKey::List(*kind, key.clone())),
        DependencyTarget::Secret(_) => None,
    })
}

/// Reconcile controller
pub struct Controller {
    /// Configuration
    config: ControllerConfig,

    reconciler: Arc<Reconciler>,

    queue: Arc<WorkQueue<ReconcileKey>>,

    /// Generations seen per object, so status-only writes do not retrigger
    observed: Mutex<Observed>,

    /// Event sender
    event_tx: broadcast::Sender<ControllerEvent>,

    /// Command receiver
    command_rx: Option<mpsc::Receiver<ControllerCommand>>,

    /// Command sender (for cloning)
    command_tx: mpsc::Sender<ControllerCommand>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, config: ControllerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(10);

        Self {
            config,
            reconciler,
            queue: Arc::new(WorkQueue::new()),
            observed: Mutex::new(Observed::default()),
            event_tx,
            command_rx: Some(command_rx),
            command_tx,
        }
    }

    /// Get an event subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_tx.subscribe()
    }

    /// Get a command sender
    pub fn command_sender(&self) -> mpsc::Sender<ControllerCommand> {
        self.command_tx.clone()
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ReconcileKey>> {
        &self.queue
    }

    fn in_scope(&self, namespace: &str) -> bool {
        self.config
            .namespace
            .as_deref()
            .map_or(true, |ns| ns == namespace)
    }

    fn observed(&self) -> std::sync::MutexGuard<'_, Observed> {
        self.observed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enqueue(&self, key: ReconcileKey) {
        tracing::debug!(key = %key, "Enqueue");
        self.queue.add(key);
    }

    async fn enqueue_dependents(&self, target: DependencyTarget) {
        match find_dependents(self.reconciler.store().as_ref(), &target).await {
            Ok(keys) => {
                for key in keys.into_iter().filter(|k| self.in_scope(&k.namespace)) {
                    self.enqueue(ReconcileKey::Profile(key));
                }
            }
            Err(e) => {
                tracing::warn!(dependency = ?target, error = %e, "Failed to look up dependents");
                self.send_event(ControllerEvent::Error {
                    message: format!("Failed to look up dependents of {:?}: {}", target, e),
                });
            }
        }
    }

    /// Turn one store change into queued keys
    ///
    /// A profile is queued only when its generation or deletion state moved.
    /// A shared list is queued, with every profile referencing it, only when
    /// its generation moved. Secret changes queue the profiles whose
    /// credentials point at the secret.
    pub async fn dispatch(&self, event: &WatchEvent) {
        match event {
            WatchEvent::ProfileApplied(profile) => {
                let key = profile.metadata.key();
                if !self.in_scope(&key.namespace) {
                    return;
                }
                let current = ObservedProfile::of(profile);
                let previous = self.observed().profiles.insert(key.clone(), current.clone());

                let changed = previous
                    .as_ref()
                    .map_or(true, |p| p.generation != current.generation || p.deleting != current.deleting);
                if changed {
                    self.enqueue(ReconcileKey::Profile(key));
                }

                let previous_targets = previous.map(|p| p.targets).unwrap_or_default();
                if previous_targets != current.targets {
                    for list in list_keys(&previous_targets).chain(list_keys(&current.targets)) {
                        self.enqueue(list);
                    }
                }
            }
            WatchEvent::ProfileDeleted(profile) => {
                let key = profile.metadata.key();
                let previous = self.observed().profiles.remove(&key);
                let targets = previous.map(|p| p.targets).unwrap_or_else(|| targets_of(profile));
                for list in list_keys(&targets) {
                    self.enqueue(list);
                }
            }
            WatchEvent::ListApplied(list) => {
                let key = list.metadata.key();
                let generation = list.metadata.generation;
                let previous = self
                    .observed()
                    .lists
                    .insert((list.kind, key.clone()), generation);
                if previous == Some(generation) {
                    return;
                }
                if self.in_scope(&key.namespace) {
                    self.enqueue(ReconcileKey::List(list.kind, key.clone()));
                }
                self.enqueue_dependents(DependencyTarget::List(list.kind, key)).await;
            }
            WatchEvent::ListDeleted(list) => {
                let key = list.metadata.key();
                self.observed().lists.remove(&(list.kind, key.clone()));
                self.enqueue_dependents(DependencyTarget::List(list.kind, key)).await;
            }
            WatchEvent::SecretApplied(key) | WatchEvent::SecretDeleted(key) => {
                self.enqueue_dependents(DependencyTarget::Secret(key.clone())).await;
            }
        }
    }

    /// Every profile and shared list key in scope
    async fn all_keys(&self) -> Result<Vec<ReconcileKey>> {
        let store = self.reconciler.store();
        let namespace = self.config.namespace.as_deref();
        let mut keys = Vec::new();

        let profiles = store.list_profiles(namespace).await?;
        {
            let mut observed = self.observed();
            for profile in &profiles {
                observed
                    .profiles
                    .insert(profile.metadata.key(), ObservedProfile::of(profile));
            }
        }
        keys.extend(profiles.iter().map(|p| ReconcileKey::Profile(p.metadata.key())));

        for kind in ListKind::ALL {
            let lists = store.list_lists(kind, namespace).await?;
            let mut observed = self.observed();
            for list in lists {
                let key = list.metadata.key();
                observed
                    .lists
                    .insert((kind, key.clone()), list.metadata.generation);
                keys.push(ReconcileKey::List(kind, key));
            }
        }
        Ok(keys)
    }

    /// Enqueue every known key
    pub async fn resync_all(&self) -> Result<usize> {
        let keys = self.all_keys().await?;
        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        tracing::debug!(keys = count, "Resync enqueued");
        self.send_event(ControllerEvent::ResyncStarted { keys: count });
        Ok(count)
    }

    /// Reconcile every known key once, in order, without workers
    ///
    /// Profiles run before shared lists so list status sees the final
    /// references.
    pub async fn reconcile_all_once(&self) -> Result<Vec<(ReconcileKey, Action)>> {
        let keys = self.all_keys().await?;
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            let action = self.reconciler.reconcile(&key).await;
            self.send_event(ControllerEvent::Reconciled {
                key: key.clone(),
                action,
            });
            results.push((key, action));
        }
        Ok(results)
    }

    /// Send an event, logging if dropped due to no receivers or channel full
    fn send_event(&self, event: ControllerEvent) {
        if let Ok(receiver_count) = self.event_tx.send(event) {
            let capacity = self.config.event_channel_capacity;
            let len = self.event_tx.len();
            if len > capacity * 80 / 100 {
                tracing::warn!(
                    current = len,
                    capacity = capacity,
                    threshold_pct = 80,
                    "Event channel nearing capacity"
                );
            }
            if receiver_count == 0 {
                tracing::trace!("Event sent but no receivers subscribed");
            }
        }
    }

    fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        (0..self.config.workers)
            .map(|worker| {
                let reconciler = Arc::clone(&self.reconciler);
                let queue = Arc::clone(&self.queue);
                let events = self.event_tx.clone();
                tokio::spawn(async move {
                    while let Some(key) = queue.next().await {
                        let action = reconciler.reconcile(&key).await;
                        queue.done(&key);
                        if let Action::Requeue(delay) = action {
                            queue.add_after(key.clone(), delay);
                        }
                        tracing::debug!(worker, key = %key, action = ?action, "Reconciled");
                        let _ = events.send(ControllerEvent::Reconciled { key, action });
                    }
                    tracing::debug!(worker, "Worker stopped");
                })
            })
            .collect()
    }

    /// Run the controller event loop with graceful shutdown on SIGTERM/SIGINT
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| crate::OperatorError::Config("Controller already running".to_string()))?;

        let mut watch = self.reconciler.store().watch();
        let workers = self.spawn_workers();
        metrics::set_health_status(true);
        self.send_event(ControllerEvent::Started);
        tracing::info!(
            workers = self.config.workers,
            resync_secs = self.config.resync_interval.as_secs(),
            namespace = self.config.namespace.as_deref().unwrap_or("*"),
            "Controller started"
        );

        self.resync_all().await?;

        let start = tokio::time::Instant::now() + self.config.resync_interval;
        let mut resync = tokio::time::interval_at(start, self.config.resync_interval);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                event = watch.recv() => match event {
                    Ok(event) => self.dispatch(&event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Watch lagged, resyncing");
                        self.resync_or_report().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("Watch stream closed");
                        break;
                    }
                },
                _ = resync.tick() => {
                    self.resync_or_report().await;
                }
                Some(cmd) = command_rx.recv() => {
                    match self.handle_command(cmd).await {
                        CommandResult::Continue => {}
                        CommandResult::Stop => break,
                    }
                }
                result = &mut shutdown => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Signal handling failed, shutting down");
                    }
                    break;
                }
            }
        }

        tracing::info!("Performing shutdown cleanup");
        self.queue.shutdown();
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Worker task failed");
            }
        }

        metrics::set_health_status(false);
        self.send_event(ControllerEvent::Stopped);
        tracing::info!("Controller shutdown complete");
        Ok(())
    }

    async fn resync_or_report(&self) {
        if let Err(e) = self.resync_all().await {
            tracing::warn!(error = %e, "Resync failed");
            self.send_event(ControllerEvent::Error {
                message: format!("Resync failed: {}", e),
            });
        }
    }

    async fn handle_command(&self, cmd: ControllerCommand) -> CommandResult {
        match cmd {
            ControllerCommand::ResyncAll => {
                self.resync_or_report().await;
                CommandResult::Continue
            }
            ControllerCommand::Shutdown => {
                tracing::info!("Received shutdown command");
                CommandResult::Stop
            }
        }
    }
}

/// Resolves on SIGTERM or SIGINT
#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).map_err(|e| {
        crate::OperatorError::Other(format!("Failed to set up SIGTERM handler: {}", e))
    })?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| {
        crate::OperatorError::Other(format!("Failed to set up SIGINT handler: {}", e))
    })?;

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, initiating graceful shutdown"),
        _ = sigint.recv() => tracing::info!("Received SIGINT, initiating graceful shutdown"),
    }
    Ok(())
}

/// Resolves on Ctrl-C
#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("Received Ctrl-C, initiating graceful shutdown");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::InMemoryPolicyApi;
    use crate::reconcile::ReconcilerConfig;
    use crate::resources::{ListEntry, ObjectMeta, ProfileSpec, ResourceRef, SharedList, SharedListSpec};
    use crate::store::InMemoryStore;

    fn controller(store: &Arc<InMemoryStore>) -> Controller {
        let reconciler = Reconciler::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryPolicyApi::new()),
            ReconcilerConfig::default(),
        );
        Controller::new(Arc::new(reconciler), ControllerConfig::default())
    }

    fn profile(name: &str) -> Profile {
        let mut spec = ProfileSpec::new(name, "creds");
        spec.denylist_refs.push(ResourceRef::new("ads"));
        Profile::new(ObjectMeta::new("home", name), spec)
    }

    #[tokio::test]
    async fn test_status_only_change_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let controller = controller(&store);
        let stored = store.apply_profile(profile("p1")).await.unwrap();

        controller.dispatch(&WatchEvent::ProfileApplied(stored.clone())).await;
        let profile_key = ReconcileKey::Profile(stored.metadata.key());
        let list_key = ReconcileKey::List(ListKind::Denylist, ResourceKey::new("home", "ads"));
        assert_eq!(controller.queue().pending(), vec![profile_key.clone(), list_key]);

        while let Some(key) = controller.queue().pending().first().cloned() {
            let taken = controller.queue().next().await.unwrap();
            assert_eq!(taken, key);
            controller.queue().done(&taken);
        }

        let mut status_write = stored;
        status_write.metadata.resource_version += 1;
        status_write.status = Some(Default::default());
        controller.dispatch(&WatchEvent::ProfileApplied(status_write)).await;
        assert!(controller.queue().is_empty());
    }

    #[tokio::test]
    async fn test_list_change_enqueues_dependents() {
        let store = Arc::new(InMemoryStore::new());
        let controller = controller(&store);
        store.apply_profile(profile("p1")).await.unwrap();
        store.apply_profile(profile("p2")).await.unwrap();
        let mut other = ProfileSpec::new("p3", "creds");
        other.denylist_refs.push(ResourceRef::new("malware"));
        store
            .apply_profile(Profile::new(ObjectMeta::new("home", "p3"), other))
            .await
            .unwrap();

        let list = store
            .apply_list(SharedList::new(
                ListKind::Denylist,
                ObjectMeta::new("home", "ads"),
                SharedListSpec {
                    description: None,
                    entries: vec![ListEntry::new("ads.example")],
                },
            ))
            .await;
        controller.dispatch(&WatchEvent::ListApplied(list.clone())).await;

        assert_eq!(
            controller.queue().pending(),
            vec![
                ReconcileKey::List(ListKind::Denylist, ResourceKey::new("home", "ads")),
                ReconcileKey::Profile(ResourceKey::new("home", "p1")),
                ReconcileKey::Profile(ResourceKey::new("home", "p2")),
            ]
        );

        // same generation again, e.g. a status write
        while !controller.queue().is_empty() {
            let key = controller.queue().next().await.unwrap();
            controller.queue().done(&key);
        }
        controller.dispatch(&WatchEvent::ListApplied(list)).await;
        assert!(controller.queue().is_empty());
    }

    #[tokio::test]
    async fn test_namespace_scope() {
        let store = Arc::new(InMemoryStore::new());
        let reconciler = Reconciler::new(
            store.clone(),
            store.clone(),
            Arc::new(InMemoryPolicyApi::new()),
            ReconcilerConfig::default(),
        );
        let controller = Controller::new(
            Arc::new(reconciler),
            ControllerConfig::default().with_namespace(Some("office".into())),
        );
        let stored = store.apply_profile(profile("p1")).await.unwrap();

        controller.dispatch(&WatchEvent::ProfileApplied(stored)).await;
        assert!(controller.queue().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_run() {
        let store = Arc::new(InMemoryStore::new());
        let mut controller = controller(&store);
        let commands = controller.command_sender();
        let mut events = controller.subscribe();

        commands.send(ControllerCommand::Shutdown).await.unwrap();
        controller.run().await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), ControllerEvent::Started));
        assert!(controller.queue().is_shutdown());
    }
}
