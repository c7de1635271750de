use kontrol::core::record::PodRecord;
use kontrol::core::script::ScriptActor;
use kontrol::core::sequence::SequenceMessage;
use kontrol::server::rpc::{self, RpcClient};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn record(key: &str) -> String {
    serde_json::to_string(&PodRecord {
        app: "myapp".to_string(),
        down: false,
        id: format!("pod-{key}"),
        ip: "10.0.0.1".to_string(),
        key: key.to_string(),
        payload: None,
        role: "worker".to_string(),
        seq: None,
    })
    .unwrap()
}

/// Binds a listener on an ephemeral port and reports it.
async fn free_port() -> u16 {
    let probe = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    probe.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_ping_lands_on_the_sequencer() {
    let port = free_port().await;
    let (sequence_tx, mut sequence_rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(rpc::run_listener(port, Some(sequence_tx), None, shutdown_rx));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut client = RpcClient::connect("127.0.0.1", port).await.unwrap();
    client.ping(&record("a")).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(5), sequence_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let SequenceMessage::Update(pod) = message;
    assert_eq!(pod.key, "a");
    assert_eq!(pod.id, "pod-a");

    shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_forwarder_pools_clients_and_delivers() {
    let port = free_port().await;
    let (sequence_tx, mut sequence_rx) = mpsc::channel(16);
    let (listener_shutdown_tx, listener_shutdown_rx) = watch::channel(false);
    tokio::spawn(rpc::run_listener(
        port,
        Some(sequence_tx),
        None,
        listener_shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (outgoing_tx, outgoing_rx) = mpsc::channel(16);
    let (forwarder_shutdown_tx, forwarder_shutdown_rx) = watch::channel(false);
    tokio::spawn(rpc::run_forwarder(outgoing_rx, port, forwarder_shutdown_rx));

    // Two keepalives for the same host ride the same pooled client.
    outgoing_tx
        .send(("127.0.0.1".to_string(), record("a")))
        .await
        .unwrap();
    outgoing_tx
        .send(("127.0.0.1".to_string(), record("b")))
        .await
        .unwrap();

    for expected in ["a", "b"] {
        let message = tokio::time::timeout(Duration::from_secs(5), sequence_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let SequenceMessage::Update(pod) = message;
        assert_eq!(pod.key, expected);
    }

    listener_shutdown_tx.send(true).unwrap();
    forwarder_shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_invoke_returns_the_script_stdout() {
    let port = free_port().await;
    let (script_tx, script_rx) = mpsc::channel(16);
    let (actor_shutdown_tx, actor_shutdown_rx) = watch::channel(false);
    tokio::spawn(ScriptActor::new(script_rx).run(actor_shutdown_rx));

    let (listener_shutdown_tx, listener_shutdown_rx) = watch::channel(false);
    tokio::spawn(rpc::run_listener(
        port,
        None,
        Some(script_tx),
        listener_shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Drive the wire format directly: one JSON frame per line.
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{Framed, LinesCodec};
    let stream = tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
        .await
        .unwrap();
    let mut framed = Framed::new(stream, LinesCodec::new());
    framed
        .send(r#"{"request":"invoke","raw":"{\"cmd\":\"echo rpc-ran\"}"}"#.to_string())
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(10), framed.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["stdout"], "rpc-ran");

    listener_shutdown_tx.send(true).unwrap();
    actor_shutdown_tx.send(true).unwrap();
}
