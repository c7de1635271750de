// src/core/script.rs

//! The script actor. A single-shot executor: every request spawns exactly one
//! subprocess, in arrival order, and completes its latch with the captured
//! stdout. No coalescing, no concurrency.

use crate::core::process;
use crate::core::TICK;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

pub enum ScriptMessage {
    Invoke {
        /// A single shell string, run through `sh -c`.
        cmd: String,
        env: HashMap<String, String>,
        /// Completed with the stdout on exit, or `None` on spawn failure.
        latch: oneshot::Sender<Option<String>>,
    },
}

pub struct ScriptActor {
    rx: mpsc::Receiver<ScriptMessage>,
}

impl ScriptActor {
    pub fn new(rx: mpsc::Receiver<ScriptMessage>) -> Self {
        Self { rx }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(ScriptMessage::Invoke { cmd, env, latch }) => {
                        self.invoke(&cmd, &env, latch, &mut shutdown).await;
                    }
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    }

    async fn invoke(
        &self,
        cmd: &str,
        env: &HashMap<String, String>,
        latch: oneshot::Sender<Option<String>>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut child = match process::spawn_shell(cmd, env) {
            Ok(child) => child,
            Err(_) => {
                warn!("script : \"{}\" could not be found (config bug ?)", cmd);
                let _ = latch.send(None);
                return;
            }
        };
        debug!("script : invoking \"{}\" (pid {})", cmd, child.pid());

        // Poll-based wait so termination stays observable at tick boundaries.
        let mut tick = tokio::time::interval(TICK);
        let exited = loop {
            tokio::select! {
                _ = tick.tick() => {
                    if child.poll() {
                        break true;
                    }
                }
                _ = shutdown.changed() => {
                    child.kill_group();
                    break false;
                }
            }
        };

        let pid = child.pid();
        let output = child.wait_drain().await;
        debug!(
            "script : \"{}\" took {:.1} s (pid {}, exit {})",
            cmd,
            output.lapse.as_secs_f64(),
            pid,
            output.code.map_or_else(|| "_".to_string(), |c| c.to_string()),
        );
        if !output.stderr.is_empty() {
            debug!("script : stderr (pid {}) -> \n  . {}", pid, output.stderr.join("\n  . "));
        }
        let _ = latch.send(exited.then(|| output.stdout.join("\n")));
    }
}
