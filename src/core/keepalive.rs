// src/core/keepalive.rs

//! The keepalive emitter. One actor per configured master: it periodically
//! reports this pod's record, reloads the optional payload file when its
//! mtime advances (forcing an early emit), and flags the record with `down`
//! on the way out so the leader can skim the pod without waiting for the TTL.

use crate::config::{Config, HTTP_PORT};
use crate::core::errors::KontrolError;
use crate::core::keys::pod_key;
use crate::core::record::PodRecord;
use crate::core::TICK;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const EMIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Where an emit goes: a direct HTTP PUT, or the RPC forwarder's queue.
pub enum KeepaliveSink {
    Http {
        client: reqwest::Client,
        url: String,
    },
    Rpc {
        outgoing: mpsc::Sender<(String, String)>,
        host: String,
    },
}

impl KeepaliveSink {
    /// HTTP sink for a master token, which may carry an explicit port.
    pub fn http(master: &str) -> Self {
        let authority = if master.contains(':') {
            master.to_string()
        } else {
            format!("{master}:{HTTP_PORT}")
        };
        Self::Http {
            client: reqwest::Client::new(),
            url: format!("http://{authority}/ping"),
        }
    }

    pub fn rpc(outgoing: mpsc::Sender<(String, String)>, master: &str) -> Self {
        Self::Rpc {
            outgoing,
            host: master.to_string(),
        }
    }
}

pub struct KeepaliveActor {
    sink: KeepaliveSink,
    app: String,
    role: String,
    id: String,
    ip: String,
    key: String,
    payload_file: Option<String>,
    payload: Option<serde_json::Value>,
    last_mtime: Option<SystemTime>,
    period: Duration,
    next_emit: Instant,
    failures: u64,
}

impl KeepaliveActor {
    pub fn new(cfg: &Config, sink: KeepaliveSink) -> Result<Self, KontrolError> {
        let ip: Ipv4Addr = cfg.ip.parse().map_err(|_| {
            KontrolError::InvalidEnv("KONTROL_IP".to_string(), cfg.ip.clone())
        })?;
        let key = pod_key(ip);
        info!("keepalive : now using key {} (pod {})", key, cfg.id);
        Ok(Self {
            sink,
            app: cfg.labels.app.clone(),
            role: cfg.labels.role.clone(),
            id: cfg.id.clone(),
            ip: cfg.ip.clone(),
            key,
            payload_file: cfg.payload.clone(),
            payload: None,
            last_mtime: None,
            period: Duration::from_millis(cfg.ttl * 750),
            next_emit: Instant::now(),
            failures: 0,
        })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = tick.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    // One last forced emit with the down trigger so the
                    // leader can gracefully skim this pod.
                    if let Err(e) = self.emit(true).await {
                        warn!("keepalive : final down emit failed -> {}", e);
                    }
                    return;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let force = self.reload_payload();
        if force || Instant::now() >= self.next_emit {
            match self.emit(false).await {
                Ok(()) => {
                    self.next_emit = Instant::now() + self.period;
                }
                Err(e) => {
                    // Counted but not fatal; the next tick retries.
                    self.failures += 1;
                    warn!("keepalive : emit failed ({} so far) -> {}", self.failures, e);
                }
            }
        }
    }

    /// Stats the payload file and reloads it when the mtime advanced.
    /// Returns true when a keepalive must be forced out of schedule.
    fn reload_payload(&mut self) -> bool {
        let Some(path) = &self.payload_file else {
            return false;
        };
        let Ok(mtime) = std::fs::metadata(path).and_then(|meta| meta.modified()) else {
            return false;
        };
        if self.last_mtime.is_some_and(|last| mtime <= last) {
            return false;
        }
        self.last_mtime = Some(mtime);
        debug!("keepalive : loading {}", path);
        match std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| Ok(serde_json::from_str::<serde_json::Value>(&raw)?))
        {
            Ok(value) => {
                self.payload = Some(value);
                true
            }
            Err(e) => {
                debug!("keepalive : skipping payload {} -> {}", path, e);
                false
            }
        }
    }

    async fn emit(&mut self, down: bool) -> anyhow::Result<()> {
        let record = PodRecord {
            app: self.app.clone(),
            down,
            id: self.id.clone(),
            ip: self.ip.clone(),
            key: self.key.clone(),
            payload: self.payload.clone(),
            role: self.role.clone(),
            seq: None,
        };
        let body = serde_json::to_string(&record)?;
        match &self.sink {
            KeepaliveSink::Http { client, url } => {
                let resp = client
                    .put(url)
                    .header(reqwest::header::CONTENT_TYPE, "application/json")
                    .timeout(EMIT_TIMEOUT)
                    .body(body)
                    .send()
                    .await?
                    .error_for_status()?;
                debug!("keepalive : HTTP {} <- PUT {}", resp.status().as_u16(), url);
            }
            KeepaliveSink::Rpc { outgoing, host } => {
                outgoing.send((host.clone(), body)).await?;
                debug!("keepalive : ping queued for rpc @ {}", host);
            }
        }
        Ok(())
    }
}
