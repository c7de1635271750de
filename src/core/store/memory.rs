// src/core/store/memory.rs

//! A single-process, in-memory [`KvStore`] with TTL and watch semantics.
//! Backs the `debug` mode and the test suite.

use super::{KvError, KvNode, KvStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

struct Node {
    value: String,
    expires_at: Option<Instant>,
}

impl Node {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    watchers: HashMap<String, broadcast::Sender<()>>,
    counter: u64,
}

/// TTL expiry is lazy: expired nodes are dropped whenever they are read past,
/// which is indistinguishable from eager expiry for the callers.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(inner: &mut Inner, key: &str) {
        if let Some(tx) = inner.watchers.get(key) {
            let _ = tx.send(());
        }
    }

    fn purge(inner: &mut Inner) {
        inner.nodes.retain(|_, node| node.live());
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        inner.nodes.insert(
            key.to_string(),
            Node {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Self::notify(&mut inner, key);
        Ok(())
    }

    async fn append(
        &self,
        dir: &str,
        stem: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<String, KvError> {
        let mut inner = self.inner.lock();
        inner.counter += 1;
        // Zero-padded so that lexicographic ordering matches creation order.
        let key = format!("{}/{}-{:020}", dir.trim_end_matches('/'), stem, inner.counter);
        inner.nodes.insert(
            key.clone(),
            Node {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(key)
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        match inner.nodes.get_mut(key) {
            Some(node) if node.live() => {
                node.expires_at = Some(Instant::now() + ttl);
                Ok(())
            }
            _ => {
                inner.nodes.remove(key);
                Err(KvError::NotFound)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.inner.lock();
        Self::purge(&mut inner);
        Ok(inner.nodes.get(key).map(|node| node.value.clone()))
    }

    async fn list(&self, dir: &str) -> Result<Vec<KvNode>, KvError> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let mut inner = self.inner.lock();
        Self::purge(&mut inner);
        Ok(inner
            .nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, node)| KvNode {
                key: key.clone(),
                value: node.value.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.inner.lock().nodes.remove(key);
        Ok(())
    }

    async fn watch(&self, key: &str, timeout: Duration) -> Result<(), KvError> {
        let mut rx = {
            let mut inner = self.inner.lock();
            inner
                .watchers
                .entry(key.to_string())
                .or_insert_with(|| broadcast::channel(16).0)
                .subscribe()
        };
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => Ok(()),
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                Err(KvError::Store("watch channel closed".to_string()))
            }
            Err(_) => Err(KvError::WatchTimeout),
        }
    }
}
