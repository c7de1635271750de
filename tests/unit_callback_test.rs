use kontrol::core::callback::{CallbackActor, CallbackMessage, CallbackRequest};
use kontrol::core::keys::KeySpace;
use kontrol::core::store::{KvStore, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

struct Harness {
    store: Arc<MemoryStore>,
    keys: KeySpace,
    tx: mpsc::Sender<CallbackMessage>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

fn boot() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let keys = KeySpace::new("/kontrol/default/myapp");
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let actor = CallbackActor::new(store.clone(), keys.clone(), rx);
    let task = tokio::spawn(actor.run(shutdown_rx));
    Harness {
        store,
        keys,
        tx,
        shutdown_tx,
        task,
    }
}

async fn invoke(harness: &Harness, cmd: &str, env: &[(&str, &str)], damper: Duration) {
    let request = CallbackRequest {
        cmd: cmd.to_string(),
        env: env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        not_before: Instant::now() + damper,
    };
    harness
        .tx
        .send(CallbackMessage::Invoke(request))
        .await
        .unwrap();
}

async fn state(harness: &Harness) -> Option<String> {
    let (reply, rx) = oneshot::channel();
    harness
        .tx
        .send(CallbackMessage::State { reply })
        .await
        .unwrap();
    rx.await.unwrap()
}

async fn shutdown(harness: Harness) {
    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn test_burst_coalesces_into_the_newest_request() {
    let harness = boot();

    // Three requests land within one damper window: exactly one subprocess
    // runs, with the newest request's parameters.
    let damper = Duration::from_millis(600);
    invoke(&harness, "echo '\"one\"'", &[], damper).await;
    invoke(&harness, "echo '\"two\"'", &[], damper).await;
    invoke(&harness, "echo '\"three\"'", &[], damper).await;

    tokio::time::sleep(Duration::from_millis(1600)).await;
    assert_eq!(state(&harness).await.as_deref(), Some("\"three\""));

    shutdown(harness).await;
}

#[tokio::test]
async fn test_requests_during_a_run_are_coalesced_into_it() {
    let harness = boot();

    invoke(&harness, "sleep 1; echo '\"first\"'", &[], Duration::ZERO).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    // The subprocess is live; this request only extends the FIFO, and the
    // completed run clears it wholesale.
    invoke(&harness, "echo '\"second\"'", &[], Duration::ZERO).await;

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(state(&harness).await.as_deref(), Some("\"first\""));

    // Nothing left over: the state stays put.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(state(&harness).await.as_deref(), Some("\"first\""));

    shutdown(harness).await;
}

#[tokio::test]
async fn test_environment_carries_request_env_and_state() {
    let harness = boot();
    harness
        .store
        .put(&harness.keys.state(), "prev", None)
        .await
        .unwrap();

    invoke(
        &harness,
        r#"printf '%s:%s' "$MD5" "$STATE""#,
        &[("MD5", "aa:bb")],
        Duration::ZERO,
    )
    .await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(state(&harness).await.as_deref(), Some("aa:bb:prev"));

    shutdown(harness).await;
}

#[tokio::test]
async fn test_non_json_stdout_is_still_published() {
    let harness = boot();

    invoke(&harness, "echo not json at all", &[], Duration::ZERO).await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    // Logged as a script error but written best-effort all the same.
    assert_eq!(state(&harness).await.as_deref(), Some("not json at all"));

    shutdown(harness).await;
}

#[tokio::test]
async fn test_multiline_stdout_is_concatenated() {
    let harness = boot();

    invoke(&harness, "printf 'a\\nb\\nc\\n'", &[], Duration::ZERO).await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(state(&harness).await.as_deref(), Some("abc"));

    shutdown(harness).await;
}

#[tokio::test]
async fn test_state_ask_reads_the_store() {
    let harness = boot();
    assert_eq!(state(&harness).await, None);

    harness
        .store
        .put(&harness.keys.state(), "{}", None)
        .await
        .unwrap();
    assert_eq!(state(&harness).await.as_deref(), Some("{}"));

    shutdown(harness).await;
}
