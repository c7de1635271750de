// src/core/leader.rs

//! The leader elector and dirty-watch loop. Every master appends a TTL'd
//! lock key; the lexicographically smallest one wins. The winner blocks on
//! the dirty sentinel, rehashes the membership on every wakeup and asks the
//! callback driver to run whenever the digest moves.

use crate::core::callback::{CallbackMessage, CallbackRequest};
use crate::core::keys::KeySpace;
use crate::core::record::PodRecord;
use crate::core::store::{KvError, KvStore};
use crate::core::TICK;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const LOCK_STEM: &str = "leader";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Initial,
    Acquire,
    Watch,
}

/// Filters out pods flagged `down`, orders the survivors by their sequence
/// index and digests the canonical JSON of the result. Returns the
/// colon-separated hex digest together with the snapshot it covers: two
/// identical memberships always come back with identical digests.
pub fn membership_digest(mut pods: Vec<PodRecord>) -> (String, String) {
    pods.retain(|pod| !pod.down);
    pods.sort_by_key(|pod| pod.seq.unwrap_or(0));
    let snapshot = serde_json::to_string(&pods).expect("records always serialize");
    let digest = Md5::digest(snapshot.as_bytes());
    let md5 = digest
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(":");
    (md5, snapshot)
}

pub struct LeaderActor {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    fover: Duration,
    damper: Duration,
    callback_cmd: Option<String>,
    callback_tx: mpsc::Sender<CallbackMessage>,
    lock: Option<String>,
    md5: Option<String>,
}

impl LeaderActor {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeySpace,
        fover_secs: u64,
        damper_secs: u64,
        callback_cmd: Option<String>,
        callback_tx: mpsc::Sender<CallbackMessage>,
    ) -> Self {
        if callback_cmd.is_none() {
            warn!("leader : $KONTROL_CALLBACK is not set (user error ?)");
        }
        Self {
            kv,
            keys,
            fover: Duration::from_secs(fover_secs),
            damper: Duration::from_secs(damper_secs),
            callback_cmd,
            callback_tx,
            lock: None,
            md5: None,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut phase = Phase::Initial;
        loop {
            if *shutdown.borrow() {
                break;
            }
            phase = match phase {
                Phase::Initial => self.initial(&mut shutdown).await,
                Phase::Acquire => self.acquire(&mut shutdown).await,
                Phase::Watch => self.watch(&mut shutdown).await,
            };
        }
        self.release().await;
    }

    /// Appends a fresh lock key with a unique sequential id.
    async fn initial(&mut self, shutdown: &mut watch::Receiver<bool>) -> Phase {
        match self
            .kv
            .append(&self.keys.locks_dir(), LOCK_STEM, "", Some(self.fover))
            .await
        {
            Ok(key) => {
                debug!("leader : created lock key {}", key);
                self.lock = Some(key);
                Phase::Acquire
            }
            Err(e) => {
                warn!("leader : unable to append a lock key -> {}", e);
                pause(shutdown, TICK).await;
                Phase::Initial
            }
        }
    }

    /// Refreshes our lock and compares it against the other contenders.
    /// The smallest key owns the lock.
    async fn acquire(&mut self, shutdown: &mut watch::Receiver<bool>) -> Phase {
        match self.refresh_lock().await {
            Ok(true) => {}
            Ok(false) => return Phase::Initial,
            Err(()) => {
                pause(shutdown, TICK).await;
                return Phase::Acquire;
            }
        }

        debug!("leader : attempting to grab lock");
        match self.lock_holder().await {
            Ok(Some(smallest)) if Some(&smallest) == self.lock.as_ref() => {
                info!("leader : now acting as leader");
                return Phase::Watch;
            }
            Ok(_) => {}
            Err(e) => warn!("leader : unable to list the locks -> {}", e),
        }

        // Retry after pausing for 1/8th of the failover TTL.
        pause(shutdown, self.fover / 8).await;
        Phase::Acquire
    }

    /// Leading: block on the dirty sentinel and rehash on every wakeup.
    async fn watch(&mut self, shutdown: &mut watch::Receiver<bool>) -> Phase {
        match self.refresh_lock().await {
            Ok(true) => {}
            Ok(false) => return Phase::Initial,
            Err(()) => {
                pause(shutdown, TICK).await;
                return Phase::Watch;
            }
        }

        // Timeouts are benign: worst case we rehash for nothing.
        let timeout = self.fover.mul_f64(0.375);
        let tick = Instant::now();
        let dirty_key = self.keys.dirty();
        tokio::select! {
            result = self.kv.watch(&dirty_key, timeout) => match result {
                Ok(()) => debug!("leader : dirty watch triggered"),
                Err(KvError::WatchTimeout) => {}
                Err(e) => debug!("leader : dirty watch failed -> {}", e),
            },
            _ = shutdown.changed() => return Phase::Watch,
        }

        debug!(
            "leader : waited on the trigger for {:.2} s, computing hash...",
            tick.elapsed().as_secs_f64()
        );
        self.rehash().await;
        Phase::Watch
    }

    /// Bumps the lock TTL. `Ok(false)` means the key vanished: we lagged too
    /// much and the lock expired, so the election restarts from scratch.
    async fn refresh_lock(&mut self) -> Result<bool, ()> {
        let Some(lock) = self.lock.clone() else {
            return Ok(false);
        };
        match self.kv.refresh(&lock, self.fover).await {
            Ok(()) => Ok(true),
            Err(KvError::NotFound) => {
                warn!("leader : lost key {} (excessive lag ?)", lock);
                self.lock = None;
                Ok(false)
            }
            Err(e) => {
                warn!("leader : unable to refresh the lock -> {}", e);
                Err(())
            }
        }
    }

    /// The smallest live lock key, if any.
    async fn lock_holder(&self) -> Result<Option<String>, KvError> {
        let stem = format!("{}/{}-", self.keys.locks_dir(), LOCK_STEM);
        let mut locks: Vec<String> = self
            .kv
            .list(&self.keys.locks_dir())
            .await?
            .into_iter()
            .map(|node| node.key)
            .filter(|key| key.starts_with(&stem))
            .collect();
        locks.sort();
        Ok(locks.into_iter().next())
    }

    /// Grabs the latest snapshot of the reporting pods and compares its
    /// digest against the last one we published a callback for.
    async fn rehash(&mut self) {
        let nodes = match self.kv.list(&self.keys.pods_dir()).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("leader : unable to read the pod records -> {}", e);
                return;
            }
        };
        let pods: Vec<PodRecord> = nodes
            .iter()
            .filter_map(|node| serde_json::from_str(&node.value).ok())
            .collect();

        let (md5, snapshot) = membership_digest(pods);
        debug!("leader : MD5 -> {}", md5);
        if self.md5.as_ref() == Some(&md5) {
            return;
        }
        self.md5 = Some(md5.clone());

        let Some(cmd) = self.callback_cmd.clone() else {
            return;
        };

        // The damper decides when the run may start; bursts of membership
        // changes collapse into a single execution on the driver side.
        let mut env = HashMap::new();
        env.insert("MD5".to_string(), md5);
        env.insert("PODS".to_string(), snapshot);
        let request = CallbackRequest {
            cmd,
            env,
            not_before: Instant::now() + self.damper,
        };
        if self.callback_tx.send(CallbackMessage::Invoke(request)).await.is_err() {
            warn!("leader : callback actor is gone, dropping the request");
        } else {
            debug!("leader : MD5 update, requesting callback");
        }
    }

    /// Proactively deletes the lock key so a graceful shutdown fails over
    /// quickly instead of waiting out the TTL.
    async fn release(&mut self) {
        if let Some(lock) = self.lock.take() {
            debug!("leader : clearing the lock");
            if let Err(e) = self.kv.delete(&lock).await {
                debug!("leader : unable to clear {} -> {}", lock, e);
            }
        }
    }
}

/// Sleeps for `dur`, waking early on shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, dur: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(dur) => {}
        _ = shutdown.changed() => {}
    }
}
