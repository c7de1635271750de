// src/core/lru.rs

//! Simple LRU cache with temporal eviction, used to pool the outbound RPC
//! clients. A background sweeper drops entries that have not been touched
//! for `grace` seconds; the sweeper stops on its own when the cache is
//! dropped, because the stop channel's sender goes away with it.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

const SWEEP_EVERY: Duration = Duration::from_secs(5);

type EvictionCallback<V> = Arc<dyn Fn(V) + Send + Sync + 'static>;

struct Inner<K, V> {
    map: HashMap<K, (V, Instant)>,
    recency: VecDeque<K>,
    grace: Duration,
    capacity: Option<usize>,
    evicted: Option<EvictionCallback<V>>,
}

pub struct LruCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
    _stop: watch::Sender<()>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates the cache and spawns its sweeper task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        grace: Duration,
        capacity: Option<usize>,
        evicted: Option<EvictionCallback<V>>,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            map: HashMap::new(),
            recency: VecDeque::new(),
            grace,
            capacity,
            evicted,
        }));
        let (stop_tx, mut stop_rx) = watch::channel(());
        let sweeper = inner.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_EVERY);
            loop {
                tokio::select! {
                    _ = tick.tick() => Self::sweep_inner(&sweeper),
                    res = stop_rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self {
            inner,
            _stop: stop_tx,
        }
    }

    /// Returns the value and refreshes both its access time and recency.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if !inner.map.contains_key(key) {
            return None;
        }
        inner.recency.retain(|k| k != key);
        inner.recency.push_front(key.clone());
        let entry = inner.map.get_mut(key).expect("checked above");
        entry.1 = Instant::now();
        Some(entry.0.clone())
    }

    /// Inserts as most-recent, evicting the least-recent entry when the
    /// capacity is exceeded.
    pub fn put(&self, key: K, val: V) {
        // The eviction callback runs outside the lock, since it may take
        // arbitrary time or re-enter the cache.
        let victim = {
            let mut inner = self.inner.lock();
            if inner.map.contains_key(&key) {
                inner.recency.retain(|k| k != &key);
            }
            inner.recency.push_front(key.clone());
            inner.map.insert(key, (val, Instant::now()));
            debug!("lru cache : + key ({} keys)", inner.map.len());
            if inner.capacity.is_some_and(|cap| inner.map.len() > cap) {
                let lru = inner.recency.pop_back();
                let val = lru.and_then(|lru| inner.map.remove(&lru)).map(|(val, _)| val);
                val.map(|val| (val, inner.evicted.clone()))
            } else {
                None
            }
        };
        if let Some((val, Some(cb))) = victim {
            cb(val);
        }
    }

    /// Evicts every entry whose last access is older than `grace`. The
    /// sweeper calls this every few seconds; tests call it directly.
    pub fn sweep(&self) {
        Self::sweep_inner(&self.inner);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_inner(inner: &Arc<Mutex<Inner<K, V>>>) {
        let (victims, evicted) = {
            let mut inner = inner.lock();
            let now = Instant::now();
            let grace = inner.grace;
            let stale: Vec<K> = inner
                .map
                .iter()
                .filter(|(_, (_, tick))| now.duration_since(*tick) > grace)
                .map(|(key, _)| key.clone())
                .collect();
            let mut victims = Vec::with_capacity(stale.len());
            for key in &stale {
                inner.recency.retain(|k| k != key);
                if let Some((val, _)) = inner.map.remove(key) {
                    victims.push(val);
                }
            }
            if !stale.is_empty() {
                debug!(
                    "lru cache : - {} stale keys ({} left)",
                    stale.len(),
                    inner.map.len()
                );
            }
            (victims, inner.evicted.clone())
        };
        if let Some(cb) = evicted {
            for val in victims {
                cb(val);
            }
        }
    }
}
