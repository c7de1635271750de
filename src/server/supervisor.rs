// src/server/supervisor.rs

//! The actor supervisor: an ordered registry of the long-running actor
//! tasks. Shutdown walks the registry in reverse insertion order, flips each
//! actor's terminate flag and waits for the task to drain.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long a single actor gets to drain before it is aborted.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

struct ActorHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub struct Supervisor {
    actors: Vec<ActorHandle>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns an actor and registers it. The closure receives the actor's
    /// private terminate flag, observed at its tick boundaries.
    pub fn spawn<F, Fut>(&mut self, name: &str, actor: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!("starting actor <{}>", name);
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(actor(rx));
        self.actors.push(ActorHandle {
            name: name.to_string(),
            shutdown,
            task,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Terminates every actor, newest first. Safe to call more than once:
    /// the registry is drained as it goes.
    pub async fn shutdown(&mut self) {
        while let Some(mut handle) = self.actors.pop() {
            debug!("terminating actor <{}>", handle.name);
            let _ = handle.shutdown.send(true);
            match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle.task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("actor <{}> panicked -> {}", handle.name, e),
                Err(_) => {
                    warn!("actor <{}> did not drain in time, aborting", handle.name);
                    handle.task.abort();
                }
            }
        }
        info!("all actors now terminated");
    }
}
