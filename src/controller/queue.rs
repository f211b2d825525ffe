//! Deduplicating work queue
//!
//! A key is held at most once while waiting and is handed to at most one
//! worker at a time. A key added while a worker holds it is marked dirty and
//! queued again once [`WorkQueue::done`] is called, so it runs exactly once
//! more after the in-flight pass.

use crate::metrics;
use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

struct QueueState<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    shutdown: bool,
}

impl<K> Default for QueueState<K> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            processing: HashSet::new(),
            dirty: HashSet::new(),
            shutdown: false,
        }
    }
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            metrics::set_queue_depth(state.ready.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn next(&self) -> Option<K> {
        loop {
            {
                let mut state = self.lock();
                if state.shutdown {
                    drop(state);
                    // wake the next sleeping worker so it can exit too
                    self.notify.notify_one();
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.ready.is_empty();
                    metrics::set_queue_depth(state.ready.len());
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            self.notify.notified().await;
        }
    }

    /// Release `key` after processing, re-queueing it if it was added meanwhile
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            metrics::set_queue_depth(state.ready.len());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys; waiting workers return `None`
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Keys waiting to be handed out, in queue order
    pub fn pending(&self) -> Vec<K> {
        self.lock().ready.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether no key is waiting, in flight or marked dirty
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.ready.is_empty() && state.processing.is_empty() && state.dirty.is_empty()
    }
}
