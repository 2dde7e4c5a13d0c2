//! Content-addressed key/value store with eviction and republish schedules.
//!
//! Each entry carries two deadlines. The eviction task drops unpinned entries
//! once their TTL has passed; the republish task periodically invokes the
//! entry's callback so the owner can re-announce the key to the network.
//! Both queues are min-heaps on deadline and live under the same lock as the
//! map. Re-inserting or unpinning a key pushes a fresh deadline and leaves the
//! old queue item behind; a popped item only acts when its deadline still
//! matches the entry's.

use log::{debug, info};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};

use crate::network::dht::NodeId;
use crate::utils::{DhtError, Result};

/// Invoked with the entry's key each time it is due for republishing.
pub type RepublishFn = Arc<dyn Fn(NodeId) + Send + Sync>;

type DeadlineQueue = BinaryHeap<Reverse<(Instant, NodeId)>>;

#[derive(Clone)]
pub struct KvEntry {
    pub key: NodeId,
    pub data: Vec<u8>,
    pub pinned: bool,
    pub eviction_deadline: Instant,
    pub republish_deadline: Instant,
    republish: Option<RepublishFn>,
}

impl KvEntry {
    pub fn republishes(&self) -> bool {
        self.republish.is_some()
    }
}

impl fmt::Debug for KvEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvEntry")
            .field("key", &self.key)
            .field("len", &self.data.len())
            .field("pinned", &self.pinned)
            .field("eviction_deadline", &self.eviction_deadline)
            .field("republish_deadline", &self.republish_deadline)
            .field("republishes", &self.republishes())
            .finish()
    }
}

#[derive(Default)]
struct State {
    entries: HashMap<NodeId, KvEntry>,
    eviction_queue: DeadlineQueue,
    republish_queue: DeadlineQueue,
}

struct Shared {
    state: Mutex<State>,
    eviction_timer: Notify,
    republish_timer: Notify,
    eviction_ttl: Duration,
    republish_interval: Duration,
}

pub struct KvStore {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl KvStore {
    /// Create the store and spawn its eviction and republish tasks, which
    /// run until the store is dropped. Must be called inside a tokio runtime.
    pub fn new(eviction_ttl: Duration, republish_interval: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            eviction_timer: Notify::new(),
            republish_timer: Notify::new(),
            eviction_ttl,
            republish_interval,
        });

        let tasks = vec![
            tokio::spawn(eviction_loop(shared.clone())),
            tokio::spawn(republish_loop(shared.clone())),
        ];

        Self { shared, tasks }
    }

    /// Insert or replace the value under `key`, scheduling its eviction and,
    /// when a callback is given, its republishing.
    pub async fn insert(
        &self,
        key: NodeId,
        pinned: bool,
        data: Vec<u8>,
        republish: Option<RepublishFn>,
    ) -> KvEntry {
        let mut state = self.shared.state.lock().await;
        self.shared.insert_locked(&mut state, key, pinned, data, republish)
    }

    /// Atomically replace the value under `key` with `f(current entry)`,
    /// keeping the entry's pin and republish settings. When `f` returns
    /// `None` the store is left untouched.
    pub async fn update<F>(&self, key: NodeId, f: F) -> Option<KvEntry>
    where
        F: FnOnce(Option<&KvEntry>) -> Option<Vec<u8>>,
    {
        let mut state = self.shared.state.lock().await;
        let current = state.entries.get(&key);
        let (pinned, republish) = current
            .map(|entry| (entry.pinned, entry.republish.clone()))
            .unwrap_or((false, None));
        let data = f(current)?;
        Some(self.shared.insert_locked(&mut state, key, pinned, data, republish))
    }

    pub async fn lookup(&self, key: &NodeId) -> Result<Vec<u8>> {
        self.shared
            .state
            .lock()
            .await
            .entries
            .get(key)
            .map(|entry| entry.data.clone())
            .ok_or(DhtError::NotFound(*key))
    }

    pub async fn contains(&self, key: &NodeId) -> bool {
        self.shared.state.lock().await.entries.contains_key(key)
    }

    /// Exempt an entry from eviction.
    pub async fn pin(&self, key: &NodeId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let entry = state.entries.get_mut(key).ok_or(DhtError::NotFound(*key))?;
        entry.pinned = true;
        debug!("Pinned {}", key);
        Ok(())
    }

    /// Make an entry evictable again, a full TTL from now.
    pub async fn unpin(&self, key: &NodeId) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let deadline = Instant::now() + self.shared.eviction_ttl;
        let entry = state.entries.get_mut(key).ok_or(DhtError::NotFound(*key))?;
        entry.pinned = false;
        entry.eviction_deadline = deadline;

        if schedule(&mut state.eviction_queue, deadline, *key) {
            self.shared.eviction_timer.notify_one();
        }
        debug!("Unpinned {}", key);
        Ok(())
    }

    /// Delete an entry. Its queue items are discarded when they come due.
    pub async fn remove(&self, key: &NodeId) -> Result<Vec<u8>> {
        self.shared
            .state
            .lock()
            .await
            .entries
            .remove(key)
            .map(|entry| entry.data)
            .ok_or(DhtError::NotFound(*key))
    }

    pub async fn len(&self) -> usize {
        self.shared.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Snapshot of every entry.
    pub async fn dump(&self) -> Vec<(NodeId, KvEntry)> {
        self.shared
            .state
            .lock()
            .await
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.clone()))
            .collect()
    }
}

impl Drop for KvStore {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Push `key` at `deadline`; true when it became the head of the queue.
fn schedule(queue: &mut DeadlineQueue, deadline: Instant, key: NodeId) -> bool {
    queue.push(Reverse((deadline, key)));
    matches!(queue.peek(), Some(Reverse((head, _))) if *head == deadline)
}

fn head(queue: &DeadlineQueue) -> Option<Instant> {
    queue.peek().map(|Reverse((deadline, _))| *deadline)
}

async fn eviction_loop(shared: Arc<Shared>) {
    loop {
        let next = head(&shared.state.lock().await.eviction_queue);
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => shared.evict_due().await,
                    _ = shared.eviction_timer.notified() => {}
                }
            }
            None => shared.eviction_timer.notified().await,
        }
    }
}

async fn republish_loop(shared: Arc<Shared>) {
    loop {
        let next = head(&shared.state.lock().await.republish_queue);
        match next {
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => shared.republish_due().await,
                    _ = shared.republish_timer.notified() => {}
                }
            }
            None => shared.republish_timer.notified().await,
        }
    }
}

impl Shared {
    fn insert_locked(
        &self,
        state: &mut State,
        key: NodeId,
        pinned: bool,
        data: Vec<u8>,
        republish: Option<RepublishFn>,
    ) -> KvEntry {
        let now = Instant::now();
        let entry = KvEntry {
            key,
            data,
            pinned,
            eviction_deadline: now + self.eviction_ttl,
            republish_deadline: now + self.republish_interval,
            republish,
        };
        state.entries.insert(key, entry.clone());

        if schedule(&mut state.eviction_queue, entry.eviction_deadline, key) {
            self.eviction_timer.notify_one();
        }
        if entry.republishes() && schedule(&mut state.republish_queue, entry.republish_deadline, key) {
            self.republish_timer.notify_one();
        }

        debug!("Stored {} ({} bytes, pinned: {})", key, entry.data.len(), pinned);
        entry
    }

    async fn evict_due(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        while let Some(Reverse((deadline, key))) = state.eviction_queue.peek().copied() {
            if deadline > now {
                break;
            }
            state.eviction_queue.pop();

            let current = match state.entries.get(&key) {
                Some(entry) if entry.eviction_deadline == deadline => entry,
                _ => continue,
            };
            if current.pinned {
                debug!("Ignoring pinned {}", key);
            } else {
                state.entries.remove(&key);
                info!("Evicted {}", key);
            }
        }
    }

    async fn republish_due(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut state = self.state.lock().await;
            while let Some(Reverse((deadline, key))) = state.republish_queue.peek().copied() {
                if deadline > now {
                    break;
                }
                state.republish_queue.pop();

                let next = now + self.republish_interval;
                let callback = match state.entries.get_mut(&key) {
                    Some(entry) if entry.republish_deadline == deadline => {
                        entry.republish_deadline = next;
                        entry.republish.clone()
                    }
                    _ => continue,
                };
                if let Some(callback) = callback {
                    state.republish_queue.push(Reverse((next, key)));
                    due.push((key, callback));
                }
            }
        }

        for (key, callback) in due {
            debug!("Republishing {}", key);
            callback(key);
        }
    }
}
