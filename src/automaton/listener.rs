// src/automaton/listener.rs

//! The UNIX socket front of the automaton. One line per connection: the
//! command is parsed, handed to the machine, and the short ASCII reply
//! (`OK`, `KO` or a state tag) is written back before the connection closes.

use crate::automaton::machine::{MachineCommand, ParsedCommand};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Accepts connections until the socket is torn down.
pub async fn run_listener(listener: UnixListener, tx: mpsc::Sender<MachineCommand>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, tx).await {
                        warn!("machine : socket connection failed -> {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("machine : unable to accept a connection -> {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    tx: mpsc::Sender<MachineCommand>,
) -> anyhow::Result<()> {
    let mut stream = BufReader::new(stream);
    let mut raw = String::new();
    stream.read_line(&mut raw).await?;
    let snippet = raw.trim_end_matches('\n').trim_end_matches('\r');
    debug!("socket -> \"{}\"", snippet);

    let reply = match ParsedCommand::parse(snippet) {
        Some(parsed) => {
            // A WAIT holds the reply slot until its script exits, so there
            // is deliberately no timeout here.
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(MachineCommand {
                parsed,
                reply: Some(reply_tx),
            })
            .await?;
            reply_rx.await.unwrap_or_else(|_| "KO".to_string())
        }
        None => "KO".to_string(),
    };

    let stream = stream.get_mut();
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Removes a stale socket file, tolerating its absence.
pub fn remove_socket(path: &Path) {
    if path.exists() {
        debug!("removing {}", path.display());
        let _ = std::fs::remove_file(path);
    }
}
