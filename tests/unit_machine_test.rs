use kontrol::automaton::machine::{MachineActor, MachineCommand, ParsedCommand};
use kontrol::automaton::manifest::Manifest;
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

#[test]
fn test_command_parsing() {
    assert!(matches!(
        ParsedCommand::parse("STATE"),
        Some(ParsedCommand::State)
    ));
    assert!(matches!(
        ParsedCommand::parse("GOTO setup"),
        Some(ParsedCommand::Goto { state, extra }) if state == "setup" && extra.is_empty()
    ));
    assert!(matches!(
        ParsedCommand::parse("WAIT setup one two"),
        Some(ParsedCommand::Wait { state, extra }) if state == "setup" && extra == "one two"
    ));
    assert!(matches!(
        ParsedCommand::parse("SET FOO bar baz"),
        Some(ParsedCommand::Set { key, value }) if key == "FOO" && value == "bar baz"
    ));
    assert!(matches!(ParsedCommand::parse("DIE"), Some(ParsedCommand::Die)));

    // Malformed or unknown commands are KO'd.
    assert!(ParsedCommand::parse("").is_none());
    assert!(ParsedCommand::parse("GOTO").is_none());
    assert!(ParsedCommand::parse("FROBNICATE x").is_none());
}

struct Harness {
    tx: mpsc::Sender<MachineCommand>,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

fn boot(manifest: &str, socket: &Path) -> Harness {
    let manifest = Manifest::parse(manifest).unwrap();
    let (tx, rx) = mpsc::channel(16);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let machine = MachineActor::new(manifest, socket.to_path_buf(), rx);
    let task = tokio::spawn(machine.run(shutdown_rx));
    Harness {
        tx,
        shutdown_tx,
        task,
    }
}

async fn command(harness: &Harness, raw: &str) -> String {
    let parsed = ParsedCommand::parse(raw).expect("a valid command");
    let (reply, rx) = oneshot::channel();
    harness
        .tx
        .send(MachineCommand {
            parsed,
            reply: Some(reply),
        })
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(20), rx)
        .await
        .expect("a reply within the window")
        .unwrap()
}

async fn wait_for(path: &Path) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !path.exists() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("the marker file shows up");
}

#[tokio::test]
async fn test_admission_execution_and_terminal_absorption() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().display();
    let manifest = format!(
        r#"
initial: ready
terminal: done
states:
  - tag: ready
    shell: ''
    next: ["step-a"]
  - tag: step-a
    shell: 'touch {base}/a.marker'
    next: ["step-b"]
  - tag: step-b
    shell: 'printf %s "$INPUT" > {base}/b.input'
    next: []
  - tag: done
    shell: 'touch {base}/done.marker'
"#
    );
    let harness = boot(&manifest, dir.path().join("machine.sock").as_path());

    // The machine trips itself into the manifest's initial state.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(command(&harness, "STATE").await, "ready");

    // ready only permits step-a; unknown states and barred targets are KO'd.
    assert_eq!(command(&harness, "WAIT bogus").await, "KO");
    assert_eq!(command(&harness, "GOTO step-b").await, "KO");
    assert_eq!(command(&harness, "STATE").await, "ready");

    assert_eq!(command(&harness, "WAIT step-a").await, "OK");
    assert!(dir.path().join("a.marker").exists());

    // The blocking ack only lands after the script exits, with $INPUT set.
    assert_eq!(command(&harness, "WAIT step-b hello world").await, "OK");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("b.input")).unwrap(),
        "hello world"
    );

    // The terminal state is always reachable, and absorbing once entered.
    assert_eq!(command(&harness, "WAIT done").await, "OK");
    assert!(dir.path().join("done.marker").exists());
    assert_eq!(command(&harness, "STATE").await, "done");
    assert_eq!(command(&harness, "GOTO step-a").await, "KO");
    assert_eq!(command(&harness, "GOTO done").await, "OK");

    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn test_queued_transition_preempts_the_running_script() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().display();
    let manifest = format!(
        r#"
initial: ready
terminal: done
states:
  - tag: ready
    shell: ''
    next: ["step-a"]
  - tag: step-a
    shell: 'touch {base}/a.started; sleep 30; touch {base}/a.finished'
    next: ["step-b"]
  - tag: step-b
    shell: 'touch {base}/b.marker'
    next: []
  - tag: done
    shell: ''
"#
    );
    let harness = boot(&manifest, dir.path().join("machine.sock").as_path());
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(command(&harness, "GOTO step-a").await, "OK");
    wait_for(&dir.path().join("a.started")).await;

    // The new transition sits out the 1s dampener, then the whole process
    // group of the sleeping script is SIGTERM'd and step-b runs.
    assert_eq!(command(&harness, "WAIT step-b").await, "OK");
    assert!(dir.path().join("b.marker").exists());
    assert!(
        !dir.path().join("a.finished").exists(),
        "the preempted script must not have run to completion"
    );

    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn test_set_mutates_the_private_spawn_environment() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().display();
    let manifest = format!(
        r#"
initial: ready
terminal: done
states:
  - tag: ready
    shell: ''
    next: ["emit"]
  - tag: emit
    shell: 'printf %s "$GREETING" > {base}/greeting'
    next: []
  - tag: done
    shell: ''
"#
    );
    let harness = boot(&manifest, dir.path().join("machine.sock").as_path());
    tokio::time::sleep(Duration::from_millis(700)).await;

    assert_eq!(command(&harness, "SET GREETING salut").await, "OK");
    assert_eq!(command(&harness, "WAIT emit").await, "OK");
    assert_eq!(
        std::fs::read_to_string(dir.path().join("greeting")).unwrap(),
        "salut"
    );

    // The mutation stays private to the machine's env map.
    assert!(std::env::var("GREETING").is_err());

    harness.shutdown_tx.send(true).unwrap();
    harness.task.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_trips_to_terminal_and_drains() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().display();
    let manifest = format!(
        r#"
initial: ready
terminal: done
states:
  - tag: ready
    shell: ''
    next: []
  - tag: done
    shell: 'touch {base}/done.marker'
"#
    );
    let harness = boot(&manifest, dir.path().join("machine.sock").as_path());
    tokio::time::sleep(Duration::from_millis(700)).await;

    harness.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(10), harness.task)
        .await
        .expect("the machine drains and exits")
        .unwrap();
    assert!(dir.path().join("done.marker").exists());
}
