// src/server/endpoint.rs

//! The HTTP endpoint: keepalive ingestion, cluster state reads, script
//! invocations on behalf of the masters, and the shutdown hook used by the
//! pod's own stop script. Every failure maps to a plain 500; the callers
//! only ever retry.

use crate::core::callback::CallbackMessage;
use crate::core::record::PodRecord;
use crate::core::script::ScriptMessage;
use crate::core::sequence::SequenceMessage;
use crate::server::supervisor::Supervisor;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::debug;

/// Blocking script invocations give up after this long.
const SCRIPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Mailbox handles for whatever actors run in this mode; a route whose
/// actor is absent answers 500.
#[derive(Clone)]
pub struct AppState {
    pub sequence_tx: Option<mpsc::Sender<SequenceMessage>>,
    pub callback_tx: Option<mpsc::Sender<CallbackMessage>>,
    pub script_tx: Option<mpsc::Sender<ScriptMessage>>,
    pub supervisor: Arc<Mutex<Supervisor>>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", put(ping))
        .route("/state", get(cluster_state))
        .route("/script", put(script))
        .route("/down", post(down))
        .with_state(state)
}

/// PUT /ping: keepalive updates from supervised containers, forwarded to
/// the sequencer (master mode only).
async fn ping(State(state): State<AppState>, body: String) -> StatusCode {
    let Some(tx) = &state.sequence_tx else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    let Ok(record) = serde_json::from_str::<PodRecord>(&body) else {
        return StatusCode::INTERNAL_SERVER_ERROR;
    };
    debug!("PUT /ping <- keepalive from {}", record.ip);
    if tx.send(SequenceMessage::Update(record)).await.is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

/// GET /state: the opaque cluster state last published by the callback.
async fn cluster_state(State(state): State<AppState>) -> Result<String, StatusCode> {
    let Some(tx) = &state.callback_tx else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    debug!("GET /state");
    let (reply, rx) = oneshot::channel();
    tx.send(CallbackMessage::State { reply })
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    let value = rx.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(value.unwrap_or_default())
}

/// PUT /script: script evaluation request from the controller, blocking on
/// a latch the script actor completes with the stdout (slave mode only).
async fn script(State(state): State<AppState>, body: String) -> Result<String, StatusCode> {
    let Some(tx) = &state.script_tx else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let Ok(request) = serde_json::from_str::<serde_json::Value>(&body) else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    let Some(cmd) = request.get("cmd").and_then(|v| v.as_str()) else {
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    };
    debug!("PUT /script <- invoking \"{}\"", cmd);

    let mut env = HashMap::new();
    env.insert("INPUT".to_string(), body.clone());
    let (latch, rx) = oneshot::channel();
    tx.send(ScriptMessage::Invoke {
        cmd: cmd.to_string(),
        env,
        latch,
    })
    .await
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    match tokio::time::timeout(SCRIPT_TIMEOUT, rx).await {
        Ok(Ok(Some(stdout))) => Ok(stdout),
        _ => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// POST /down: terminates every actor, then leaves the endpoint idle. This
/// is triggered during shutdown by the pod's stop script.
async fn down(State(state): State<AppState>) -> StatusCode {
    state.supervisor.lock().await.shutdown().await;
    StatusCode::OK
}
