use kontrol::automaton::listener::{remove_socket, run_listener};
use kontrol::automaton::machine::MachineActor;
use kontrol::automaton::manifest::Manifest;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

async fn send(socket: &Path, line: &str) -> String {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    stream.write_all(line.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn test_line_protocol_over_the_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("automaton.sock");
    let base = dir.path().display();
    let manifest = Manifest::parse(&format!(
        r#"
initial: ready
terminal: done
states:
  - tag: ready
    shell: ''
    next: ["emit"]
  - tag: emit
    shell: 'printf %s "$INPUT" > {base}/input'
    next: []
  - tag: done
    shell: ''
"#
    ))
    .unwrap();

    remove_socket(&socket);
    let unix = UnixListener::bind(&socket).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let machine = tokio::spawn(MachineActor::new(manifest, socket.clone(), rx).run(shutdown_rx));
    let accept = tokio::spawn(run_listener(unix, tx));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(send(&socket, "STATE").await, "ready");

    // WAIT holds the connection open until the script has run.
    assert_eq!(send(&socket, "WAIT emit with args").await, "OK");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("input")).unwrap(),
        "with args"
    );

    // Unknown commands and barred transitions are KO'd on the wire.
    assert_eq!(send(&socket, "FROBNICATE").await, "KO");
    assert_eq!(send(&socket, "GOTO ready").await, "KO");

    // DIE trips the machine to its terminal state.
    assert_eq!(send(&socket, "DIE").await, "OK");
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(send(&socket, "STATE").await, "done");

    accept.abort();
    shutdown_tx.send(true).unwrap();
    machine.await.unwrap();
    remove_socket(&socket);
}
