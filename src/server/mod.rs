// src/server/mod.rs

//! Role-based wiring: assembles the actor set for the configured mode,
//! starts the transports and keeps everything alive until a termination
//! signal or a POST /down.

pub mod endpoint;
pub mod rpc;
pub mod supervisor;

use crate::config::{Config, HTTP_PORT};
use crate::core::callback::CallbackActor;
use crate::core::keepalive::{KeepaliveActor, KeepaliveSink};
use crate::core::keys::KeySpace;
use crate::core::leader::LeaderActor;
use crate::core::script::ScriptActor;
use crate::core::sequence::SequenceActor;
use crate::core::store::{EtcdStore, KvStore, MemoryStore};
use anyhow::Result;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

/// The main startup function: builds the actors for the configured roles,
/// serves HTTP (and RPC when enabled) and blocks until shutdown.
pub async fn run(cfg: Config) -> Result<()> {
    let keys = KeySpace::new(&cfg.prefix);
    let kv: Arc<dyn KvStore> = if cfg.mode.debug {
        // Local test drive: no etcd around, coordinate in-process.
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(EtcdStore::new(&cfg.etcd))
    };

    let mut supervisor = Supervisor::new();
    let mut sequence_tx = None;
    let mut callback_tx = None;
    let mut script_tx = None;

    // The outbound keepalive queue, drained by the RPC forwarder. The
    // forwarder registers first so it is torn down last and the keepalives'
    // final down emit still has a ride out.
    let (outgoing_tx, outgoing_rx) = mpsc::channel::<(String, String)>(64);
    if let Some(port) = cfg.port {
        supervisor.spawn("rpc-forwarder", move |shutdown| {
            rpc::run_forwarder(outgoing_rx, port, shutdown)
        });
    }

    // Master mode requires the callback, leader and sequence actors.
    if cfg.mode.master {
        let (tx, rx) = mpsc::channel(64);
        let callback = CallbackActor::new(kv.clone(), keys.clone(), rx);
        supervisor.spawn("callback", move |shutdown| callback.run(shutdown));
        callback_tx = Some(tx.clone());

        let leader = LeaderActor::new(
            kv.clone(),
            keys.clone(),
            cfg.fover,
            cfg.damper,
            cfg.callback.clone(),
            tx,
        );
        supervisor.spawn("leader", move |shutdown| leader.run(shutdown));

        let (tx, rx) = mpsc::channel(256);
        let sequence = SequenceActor::new(kv.clone(), keys.clone(), cfg.ttl, rx);
        supervisor.spawn("sequence", move |shutdown| sequence.run(shutdown));
        sequence_tx = Some(tx);
    }

    // Slave mode requires one keepalive actor per master, plus the script
    // actor.
    if cfg.mode.slave {
        for master in cfg.masters() {
            let sink = if cfg.mode.rpc {
                KeepaliveSink::rpc(outgoing_tx.clone(), &master)
            } else {
                KeepaliveSink::http(&master)
            };
            let keepalive = KeepaliveActor::new(&cfg, sink)?;
            supervisor.spawn(&format!("keepalive({master})"), move |shutdown| {
                keepalive.run(shutdown)
            });
        }

        let (tx, rx) = mpsc::channel(64);
        let script = ScriptActor::new(rx);
        supervisor.spawn("script", move |shutdown| script.run(shutdown));
        script_tx = Some(tx);
    }

    // The inbound RPC transport rides on $KONTROL_PORT when it is set.
    if let Some(port) = cfg.port {
        let listener_sequence = sequence_tx.clone();
        let listener_script = script_tx.clone();
        supervisor.spawn("rpc", move |shutdown| {
            rpc::run_listener(port, listener_sequence, listener_script, shutdown)
        });
    }

    let supervisor = Arc::new(Mutex::new(supervisor));
    let app = endpoint::router(endpoint::AppState {
        sequence_tx,
        callback_tx,
        script_tx,
        supervisor: supervisor.clone(),
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{HTTP_PORT}")).await?;
    info!("endpoint listening on port {}", HTTP_PORT);

    let server = axum::serve(listener, app).with_graceful_shutdown(await_shutdown_signal());
    server.await?;

    // The signal already fired; terminate whatever POST /down did not.
    supervisor.lock().await.shutdown().await;
    Ok(())
}

/// Waits for SIGINT or SIGTERM.
async fn await_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM stream");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}
