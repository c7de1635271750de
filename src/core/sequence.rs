// src/core/sequence.rs

//! The membership sequencer. It owns the set of currently-known slave keys,
//! assigns each a stable monotone sequence index, republishes the record
//! with the pod TTL, and touches the dirty sentinel so the elected leader
//! wakes up and rehashes.

use crate::core::keys::KeySpace;
use crate::core::record::PodRecord;
use crate::core::store::KvStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub enum SequenceMessage {
    /// A keepalive landed on /ping (HTTP or RPC).
    Update(PodRecord),
}

pub struct SequenceActor {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    ttl: Duration,
    rx: mpsc::Receiver<SequenceMessage>,
    seqs: HashMap<String, u64>,
    last_seq: u64,
}

impl SequenceActor {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeySpace,
        ttl_secs: u64,
        rx: mpsc::Receiver<SequenceMessage>,
    ) -> Self {
        Self {
            kv,
            keys,
            ttl: Duration::from_secs(ttl_secs),
            rx,
            seqs: HashMap::new(),
            last_seq: 0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(SequenceMessage::Update(record)) => self.update(record).await,
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn update(&mut self, mut record: PodRecord) {
        if record.key.is_empty() {
            warn!("sequence : dropping keepalive with an empty key (bug ?)");
            return;
        }

        // Indices are assigned once per key and never reused within this
        // actor's lifetime; the map only ever grows.
        let seq = *self.seqs.entry(record.key.clone()).or_insert_with(|| {
            self.last_seq += 1;
            self.last_seq
        });
        record.seq = Some(seq);

        let raw = match serde_json::to_string(&record) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("sequence : unable to serialize record for {} -> {}", record.key, e);
                return;
            }
        };

        if let Err(e) = self.kv.put(&self.keys.pod(&record.key), &raw, Some(self.ttl)).await {
            warn!("sequence : failed to publish record for {} -> {}", record.key, e);
            return;
        }
        if let Err(e) = self.kv.put(&self.keys.dirty(), "", None).await {
            warn!("sequence : failed to touch the dirty key -> {}", e);
        }
        debug!("sequence : published {} (seq {})", record.key, seq);
    }
}
