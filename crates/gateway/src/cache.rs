use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    /// Idle for longer than the configured TTL.
    Expired,
    /// Pushed out by a newer entry once the cache was full.
    Capacity,
    /// Removed by `invalidate` / `invalidate_all`.
    Explicit,
}

impl RemovalCause {
    pub fn as_str(self) -> &'static str {
        match self {
            RemovalCause::Expired => "expired",
            RemovalCause::Capacity => "capacity",
            RemovalCause::Explicit => "explicit",
        }
    }
}

/// Cleanup hook invoked exactly once for every entry that leaves the cache.
///
/// Runs on its own task once the entry is out of the map, so a caller that
/// gives up waiting cannot cut it short. Implementations must not propagate
/// failures.
#[async_trait]
pub trait RemovalListener<K, V>: Send + Sync {
    async fn on_removal(&self, key: K, value: Arc<V>, cause: RemovalCause);
}

struct Entry<V> {
    value: Arc<V>,
    last_access: Instant,
}

type LoadSlot<V, E> = Option<Result<Arc<V>, E>>;

struct CacheState<K: Hash + Eq, V, E> {
    entries: LruCache<K, Entry<V>>,
    in_flight: HashMap<K, watch::Receiver<LoadSlot<V, E>>>,
}

struct Shared<K: Hash + Eq, V, E> {
    state: Mutex<CacheState<K, V, E>>,
    idle_ttl: Duration,
    listener: Arc<dyn RemovalListener<K, V>>,
}

impl<K: Hash + Eq, V, E> Shared<K, V, E> {
    fn lock(&self) -> MutexGuard<'_, CacheState<K, V, E>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.last_access) >= self.idle_ttl
    }
}

enum Lookup<V, E> {
    Hit(Arc<V>),
    Wait(watch::Receiver<LoadSlot<V, E>>),
    Lead(watch::Sender<LoadSlot<V, E>>),
}

/// Removes the in-flight marker if the leading load is dropped before it
/// publishes a result, so waiters can elect a new leader.
struct InFlightGuard<K: Hash + Eq, V, E> {
    shared: Arc<Shared<K, V, E>>,
    key: Option<K>,
}

impl<K: Hash + Eq, V, E> InFlightGuard<K, V, E> {
    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<K: Hash + Eq, V, E> Drop for InFlightGuard<K, V, E> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.shared.lock().in_flight.remove(&key);
        }
    }
}

/// A bounded key/value cache that builds missing values on demand.
///
/// * Loads are single-flight per key: concurrent lookups of the same missing
///   key wait on one construction and all observe its result. Other keys are
///   never blocked by a pending load.
/// * Failed loads are not cached.
/// * Entries expire after `idle_ttl` without access. Expiry is applied
///   lazily on lookup and by [`sweep_expired`](Self::sweep_expired).
/// * At most `capacity` entries are resident; admitting one more evicts the
///   least recently accessed.
///
/// Every removal is reported once to the [`RemovalListener`].
pub struct LoadingCache<K: Hash + Eq, V, E> {
    shared: Arc<Shared<K, V, E>>,
}

impl<K: Hash + Eq, V, E> Clone for LoadingCache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, V, E> LoadingCache<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(
        capacity: NonZeroUsize,
        idle_ttl: Duration,
        listener: Arc<dyn RemovalListener<K, V>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState {
                    entries: LruCache::new(capacity),
                    in_flight: HashMap::new(),
                }),
                idle_ttl,
                listener,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the live value for `key`, running `load` if there is none.
    ///
    /// Cancel-safe: dropping the returned future releases leadership of the
    /// load and never abandons a cleanup already started.
    pub async fn get_with<F, Fut>(&self, key: K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let (sender, expired) = loop {
            match self.lookup(&key) {
                (Lookup::Hit(value), _) => return Ok(value),
                (Lookup::Wait(receiver), _) => {
                    if let Some(result) = wait_for_load(receiver).await {
                        return result;
                    }
                }
                (Lookup::Lead(sender), expired) => break (sender, expired),
            }
        };

        // Declared after `sender` so the marker is gone before waiters wake.
        let mut guard = InFlightGuard {
            shared: self.shared.clone(),
            key: Some(key.clone()),
        };

        if let Some(cleanup) = expired {
            finish_removal(cleanup).await;
        }

        let result = load().await.map(Arc::new);

        let displaced = {
            let mut state = self.shared.lock();
            state.in_flight.remove(&key);
            guard.disarm();

            match &result {
                Ok(value) => {
                    let now = Instant::now();
                    let entry = Entry {
                        value: value.clone(),
                        last_access: now,
                    };
                    state.entries.push(key.clone(), entry).map(|(old_key, old)| {
                        debug_assert!(old_key != key, "in-flight marker admits one load per key");
                        let cause = if self.shared.is_expired(&old, now) {
                            RemovalCause::Expired
                        } else {
                            RemovalCause::Capacity
                        };
                        self.spawn_removal(old_key, old.value, cause)
                    })
                }
                Err(_) => None,
            }
        };

        sender.send_replace(Some(result.clone()));

        if let Some(cleanup) = displaced {
            finish_removal(cleanup).await;
        }

        result
    }

    /// Resolves `key` under the lock. An expired entry is popped and its
    /// cleanup spawned before the lock is released.
    fn lookup(&self, key: &K) -> (Lookup<V, E>, Option<JoinHandle<()>>) {
        let mut state = self.shared.lock();
        let now = Instant::now();

        let mut expired = None;
        if let Some(entry) = state.entries.get_mut(key) {
            if now.saturating_duration_since(entry.last_access) < self.shared.idle_ttl {
                entry.last_access = now;
                return (Lookup::Hit(entry.value.clone()), None);
            }
            expired = state
                .entries
                .pop(key)
                .map(|entry| self.spawn_removal(key.clone(), entry.value, RemovalCause::Expired));
        }

        // A closed channel means the leader is gone; take over.
        let live = state
            .in_flight
            .get(key)
            .filter(|receiver| receiver.has_changed().is_ok())
            .cloned();
        let lookup = match live {
            Some(receiver) => Lookup::Wait(receiver),
            None => {
                let (sender, receiver) = watch::channel(None);
                state.in_flight.insert(key.clone(), receiver);
                Lookup::Lead(sender)
            }
        };
        (lookup, expired)
    }

    fn spawn_removal(&self, key: K, value: Arc<V>, cause: RemovalCause) -> JoinHandle<()> {
        let listener = self.shared.listener.clone();
        tokio::spawn(async move { listener.on_removal(key, value, cause).await })
    }

    /// Returns the live value without loading or refreshing its idle clock.
    pub fn peek(&self, key: &K) -> Option<Arc<V>> {
        let state = self.shared.lock();
        let now = Instant::now();
        state
            .entries
            .peek(key)
            .filter(|entry| !self.shared.is_expired(entry, now))
            .map(|entry| entry.value.clone())
    }

    pub async fn invalidate(&self, key: &K) -> bool {
        let cleanup = {
            let mut state = self.shared.lock();
            state
                .entries
                .pop(key)
                .map(|entry| self.spawn_removal(key.clone(), entry.value, RemovalCause::Explicit))
        };
        match cleanup {
            Some(cleanup) => {
                finish_removal(cleanup).await;
                true
            }
            None => false,
        }
    }

    pub async fn invalidate_all(&self) -> usize {
        let cleanups = {
            let mut state = self.shared.lock();
            let mut cleanups = Vec::with_capacity(state.entries.len());
            while let Some((key, entry)) = state.entries.pop_lru() {
                cleanups.push(self.spawn_removal(key, entry.value, RemovalCause::Explicit));
            }
            cleanups
        };

        let count = cleanups.len();
        for cleanup in cleanups {
            finish_removal(cleanup).await;
        }
        count
    }

    /// Removes every entry whose idle time has run out. Returns how many
    /// were removed.
    pub async fn sweep_expired(&self) -> usize {
        let cleanups = {
            let mut state = self.shared.lock();
            let now = Instant::now();
            let mut cleanups = Vec::new();
            // Recency order matches last-access order, so stop at the first live entry.
            while let Some((_, entry)) = state.entries.peek_lru() {
                if !self.shared.is_expired(entry, now) {
                    break;
                }
                if let Some((key, entry)) = state.entries.pop_lru() {
                    cleanups.push(self.spawn_removal(key, entry.value, RemovalCause::Expired));
                }
            }
            cleanups
        };

        let count = cleanups.len();
        for cleanup in cleanups {
            finish_removal(cleanup).await;
        }
        count
    }
}

async fn finish_removal(cleanup: JoinHandle<()>) {
    if let Err(err) = cleanup.await {
        tracing::error!(error = %err, "cache removal listener panicked");
    }
}

/// `None` when the leader went away without publishing; the caller retries.
async fn wait_for_load<V, E: Clone>(
    mut receiver: watch::Receiver<LoadSlot<V, E>>,
) -> Option<Result<Arc<V>, E>> {
    match receiver.wait_for(|slot| slot.is_some()).await {
        Ok(slot) => slot.clone(),
        Err(_) => None,
    }
}
