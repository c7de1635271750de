// src/automaton/mod.rs

//! The standalone automaton: a FIFO-driven state machine whose states each
//! carry a shell snippet, tripped over a local UNIX socket.

pub mod listener;
pub mod machine;
pub mod manifest;

use crate::automaton::machine::MachineActor;
use crate::automaton::manifest::Manifest;
use anyhow::Result;
use std::path::PathBuf;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

pub const DEFAULT_SOCKET: &str = "/var/run/automaton.sock";

/// Command-line options of the automaton mode.
#[derive(Debug)]
pub struct AutomatonOpts {
    /// YAML manifest (or its plugin form) describing the states.
    pub input: PathBuf,
    /// UNIX socket path.
    pub socket: PathBuf,
}

/// Runs the automaton until its terminal state has been reached after a
/// termination signal.
pub async fn run(opts: AutomatonOpts) -> Result<()> {
    let manifest = Manifest::load(&opts.input)?;
    info!(
        "automaton : {} state(s), initial \"{}\", terminal \"{}\"",
        manifest.states.len(),
        manifest.initial,
        manifest.terminal
    );

    listener::remove_socket(&opts.socket);
    let unix = UnixListener::bind(&opts.socket)?;
    info!("automaton : listening on {}", opts.socket.display());

    let (tx, rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let socket = opts.socket.clone();
    let machine = MachineActor::new(manifest, socket, rx);
    let actor = tokio::spawn(machine.run(shutdown_rx));
    let accept = tokio::spawn(listener::run_listener(unix, tx.clone()));

    await_termination().await;
    info!("automaton : tripping to the terminal state");

    // Stop taking commands; the machine trips itself to terminal and drains.
    accept.abort();
    let _ = shutdown_tx.send(true);
    if let Err(e) = actor.await {
        warn!("automaton : machine task failed -> {}", e);
    }
    drop(tx);

    listener::remove_socket(&opts.socket);
    Ok(())
}

async fn await_termination() {
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM stream");
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, shutting down."),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down."),
    }
}
