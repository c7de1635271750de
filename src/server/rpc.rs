// src/server/rpc.rs

//! The alternate RPC transport: newline-delimited JSON frames over TCP.
//! Inbound, the listener accepts the same `ping`/`invoke` requests the HTTP
//! endpoint serves. Outbound, the forwarder drains the keepalive queue
//! through a small pool of per-host clients managed by the LRU cache.

use crate::core::lru::LruCache;
use crate::core::record::PodRecord;
use crate::core::script::ScriptMessage;
use crate::core::sequence::SequenceMessage;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CALL_TIMEOUT: Duration = Duration::from_secs(2);
const INVOKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle clients are closed after this long without a keepalive to carry.
const CLIENT_GRACE: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize, Debug)]
struct RpcRequest {
    request: String,
    raw: String,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct RpcResponse {
    ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stdout: Option<String>,
}

/// Accepts RPC connections until shutdown.
pub async fn run_listener(
    port: u16,
    sequence_tx: Option<mpsc::Sender<SequenceMessage>>,
    script_tx: Option<mpsc::Sender<ScriptMessage>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("rpc : unable to bind port {} -> {}", port, e);
            return;
        }
    };
    info!("rpc : listening on port {}", port);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    debug!("rpc : connection from {}", addr);
                    let sequence_tx = sequence_tx.clone();
                    let script_tx = script_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(socket, sequence_tx, script_tx).await {
                            warn!("rpc : connection from {} failed -> {}", addr, e);
                        }
                    });
                }
                Err(e) => warn!("rpc : unable to accept a connection -> {}", e),
            },
            _ = shutdown.changed() => return,
        }
    }
}

async fn handle_connection(
    socket: TcpStream,
    sequence_tx: Option<mpsc::Sender<SequenceMessage>>,
    script_tx: Option<mpsc::Sender<ScriptMessage>>,
) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LinesCodec::new());
    while let Some(line) = framed.next().await {
        let line = line?;
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => dispatch(request, &sequence_tx, &script_tx).await,
            Err(e) => {
                warn!("rpc : bogus frame -> {}", e);
                RpcResponse::default()
            }
        };
        framed.send(serde_json::to_string(&response)?).await?;
    }
    Ok(())
}

async fn dispatch(
    request: RpcRequest,
    sequence_tx: &Option<mpsc::Sender<SequenceMessage>>,
    script_tx: &Option<mpsc::Sender<ScriptMessage>>,
) -> RpcResponse {
    match request.request.as_str() {
        "ping" => {
            let Some(tx) = sequence_tx else {
                return RpcResponse::default();
            };
            let Ok(record) = serde_json::from_str::<PodRecord>(&request.raw) else {
                return RpcResponse::default();
            };
            debug!("RPC ping() <- {} [{}]", record.ip, record.app);
            RpcResponse {
                ok: tx.send(SequenceMessage::Update(record)).await.is_ok(),
                stdout: None,
            }
        }
        "invoke" => {
            let Some(tx) = script_tx else {
                return RpcResponse::default();
            };
            let Some(cmd) = serde_json::from_str::<serde_json::Value>(&request.raw)
                .ok()
                .and_then(|js| js.get("cmd").and_then(|v| v.as_str()).map(str::to_string))
            else {
                return RpcResponse::default();
            };
            debug!("RPC invoke() <- \"{}\"", cmd);

            let mut env = HashMap::new();
            env.insert("INPUT".to_string(), request.raw.clone());
            let (latch, rx) = oneshot::channel();
            if tx.send(ScriptMessage::Invoke { cmd, env, latch }).await.is_err() {
                return RpcResponse::default();
            }
            match tokio::time::timeout(INVOKE_TIMEOUT, rx).await {
                Ok(Ok(stdout)) => RpcResponse { ok: true, stdout },
                _ => RpcResponse::default(),
            }
        }
        other => {
            warn!("rpc : unknown request \"{}\"", other);
            RpcResponse::default()
        }
    }
}

/// A pooled client for one peer.
pub struct RpcClient {
    framed: Framed<TcpStream, LinesCodec>,
}

impl RpcClient {
    pub async fn connect(host: &str, port: u16) -> anyhow::Result<Self> {
        let stream = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect(format!("{host}:{port}")),
        )
        .await??;
        Ok(Self {
            framed: Framed::new(stream, LinesCodec::new()),
        })
    }

    /// Fire-and-forget keepalive: the reply only confirms delivery.
    pub async fn ping(&mut self, raw: &str) -> anyhow::Result<()> {
        let frame = serde_json::to_string(&RpcRequest {
            request: "ping".to_string(),
            raw: raw.to_string(),
        })?;
        self.framed.send(frame).await?;
        match tokio::time::timeout(CALL_TIMEOUT, self.framed.next()).await {
            Ok(Some(Ok(_))) => Ok(()),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(anyhow::anyhow!("connection closed by peer")),
            Err(_) => Err(anyhow::anyhow!("timed out waiting for the reply")),
        }
    }
}

/// Drains the outgoing keepalive queue, pooling one client per master host.
/// Idle clients age out of the LRU cache and are closed by its eviction
/// callback (here, simply dropped).
pub async fn run_forwarder(
    mut outgoing: mpsc::Receiver<(String, String)>,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let clients: LruCache<String, Arc<Mutex<RpcClient>>> = LruCache::new(
        CLIENT_GRACE,
        None,
        Some(Arc::new(|_client| {
            debug!("rpc : closing an idle client");
        })),
    );

    loop {
        tokio::select! {
            pair = outgoing.recv() => {
                let Some((host, raw)) = pair else { return };
                let client = match clients.get(&host) {
                    Some(client) => client,
                    None => match RpcClient::connect(&host, port).await {
                        Ok(client) => {
                            let client = Arc::new(Mutex::new(client));
                            clients.put(host.clone(), client.clone());
                            client
                        }
                        Err(e) => {
                            error!("rpc : unable to ping() @ {} -> {}", host, e);
                            continue;
                        }
                    },
                };
                if let Err(e) = client.lock().await.ping(&raw).await {
                    error!("rpc : unable to ping() @ {} -> {}", host, e);
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
