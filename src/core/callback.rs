// src/core/callback.rs

//! The callback driver. Requests are buffered in a FIFO but only the newest
//! one is ever executed: the driver sits out the damper window, spawns a
//! single subprocess with the merged environment, publishes its stdout under
//! the state key and drops every request the run coalesced.

use crate::core::keys::KeySpace;
use crate::core::process::{self, ShellChild};
use crate::core::store::KvStore;
use crate::core::TICK;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub enum CallbackMessage {
    /// Run the callback once the damper expires.
    Invoke(CallbackRequest),
    /// GET /state: read the last published stdout.
    State {
        reply: oneshot::Sender<Option<String>>,
    },
}

pub struct CallbackRequest {
    /// A single shell string, run through `sh -c`.
    pub cmd: String,
    pub env: HashMap<String, String>,
    /// The damper deadline: the request must not run before this instant.
    pub not_before: Instant,
}

pub struct CallbackActor {
    kv: Arc<dyn KvStore>,
    keys: KeySpace,
    rx: mpsc::Receiver<CallbackMessage>,
    fifo: VecDeque<CallbackRequest>,
    running: Option<ShellChild>,
    countdown: Option<u64>,
    terminate: bool,
}

impl CallbackActor {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: KeySpace,
        rx: mpsc::Receiver<CallbackMessage>,
    ) -> Self {
        Self {
            kv,
            keys,
            rx,
            fifo: VecDeque::new(),
            running: None,
            countdown: None,
            terminate: false,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(TICK);
        loop {
            if self.terminate && self.fifo.is_empty() && self.running.is_none() {
                return;
            }
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(CallbackMessage::Invoke(request)) => self.fifo.push_back(request),
                    Some(CallbackMessage::State { reply }) => {
                        let _ = reply.send(self.read_state().await);
                    }
                    None => return,
                },
                _ = tick.tick() => self.step().await,
                _ = shutdown.changed(), if !self.terminate => {
                    // Pending requests still run; the actor drains its FIFO
                    // before going away.
                    self.terminate = true;
                }
            }
        }
    }

    async fn step(&mut self) {
        if let Some(child) = self.running.as_mut() {
            if child.poll() {
                let child = self.running.take().expect("child is running");
                self.complete(child).await;
            }
            return;
        }

        let Some(latest) = self.fifo.back() else {
            return;
        };

        // Honor the damper: it is too early to execute the script until the
        // newest request's deadline has passed.
        let now = Instant::now();
        if latest.not_before > now {
            let left = (latest.not_before - now).as_secs();
            if self.countdown != Some(left) {
                self.countdown = Some(left);
                debug!("callback : invocation in {} seconds", left);
            }
            return;
        }
        self.countdown = None;

        let mut env = latest.env.clone();
        if let Ok(Some(raw)) = self.kv.get(&self.keys.state()).await {
            if !raw.is_empty() {
                env.insert("STATE".to_string(), raw);
            }
        }

        let cmd = latest.cmd.clone();
        match process::spawn_shell(&cmd, &env) {
            Ok(child) => {
                debug!("callback : invoking script \"{}\" (pid {})", cmd, child.pid());
                self.running = Some(child);
            }
            Err(_) => {
                warn!("callback : script \"{}\" could not be found (config bug ?)", cmd);
                self.fifo.pop_front();
            }
        }
    }

    async fn complete(&mut self, child: ShellChild) {
        let pid = child.pid();
        let output = child.wait_drain().await;
        info!(
            "callback : script took {:.1} s (pid {}, exit {})",
            output.lapse.as_secs_f64(),
            pid,
            output.code.map_or_else(|| "_".to_string(), |c| c.to_string()),
        );
        if !output.stderr.is_empty() {
            debug!("callback : stderr (pid {}) -> \n  . {}", pid, output.stderr.join("\n  . "));
        }

        // The stdout lines are concatenated as-is and published best-effort;
        // a script emitting something other than JSON is flagged but not
        // rejected.
        let raw = output.stdout.concat();
        if serde_json::from_str::<serde_json::Value>(&raw).is_err() {
            warn!("callback : unable to parse stdout into json (script error ?)");
        }
        if let Err(e) = self.kv.put(&self.keys.state(), &raw, None).await {
            warn!("callback : failed to publish the state key -> {}", e);
        }

        // Everything buffered during the run was coalesced into it.
        self.fifo.clear();
    }

    async fn read_state(&self) -> Option<String> {
        self.kv.get(&self.keys.state()).await.ok().flatten()
    }
}
