// src/core/store/mod.rs

//! The distributed KV contract consumed by the coordination actors.
//!
//! Two implementations ship with the runtime: [`EtcdStore`], a thin adapter
//! over the etcd v2 keys API, and [`MemoryStore`], a single-process stand-in
//! used by the `debug` mode and the test suite. Everything the actors need is
//! captured by the [`KvStore`] trait: TTL'd writes, ordered appends for the
//! election locks, and a blocking watch for the dirty sentinel.

mod etcd;
mod memory;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by a [`KvStore`]. Only `NotFound` on a refresh carries
/// control-flow meaning (the election lock expired); everything else is
/// treated as transient by the callers.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("key not found")]
    NotFound,

    #[error("watch timed out")]
    WatchTimeout,

    #[error("store error: {0}")]
    Store(String),
}

/// One leaf under a directory listing.
#[derive(Debug, Clone, PartialEq)]
pub struct KvNode {
    pub key: String,
    pub value: String,
}

/// The slice of a distributed KV store the runtime relies on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Writes `value` at `key`, overwriting, with an optional TTL after which
    /// the key silently expires.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Atomically creates an ordered child of `dir` named
    /// `<stem>-<strictly increasing index>` and returns the full key.
    async fn append(
        &self,
        dir: &str,
        stem: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<String, KvError>;

    /// Bumps the TTL of an existing key without touching its value or waking
    /// watchers. `NotFound` means the key already expired.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<(), KvError>;

    /// Reads a single key. A missing or expired key reads as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Lists all live leaves under `dir`, recursively.
    async fn list(&self, dir: &str) -> Result<Vec<KvNode>, KvError>;

    /// Deletes a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Blocks until `key` is written or `timeout` elapses, whichever comes
    /// first. A timeout is reported as `WatchTimeout` and is benign for the
    /// dirty-watch loop.
    async fn watch(&self, key: &str, timeout: Duration) -> Result<(), KvError>;
}
