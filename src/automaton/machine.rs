// src/automaton/machine.rs

//! The state machine actor. Transition requests are buffered in a FIFO and
//! processed in order; each admitted transition runs its state's shell
//! snippet in a fresh process group. Tripping the machine while a script is
//! still running kills the whole group, after a short dampener so a script
//! dispatching into its own socket cannot kill itself.

use crate::automaton::manifest::{Manifest, StateDef};
use crate::core::process::{self, ShellChild};
use crate::core::TICK;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Grace period before a queued transition may preempt the running script.
const PREEMPTION_DAMPENER: Duration = Duration::from_secs(1);

/// A parsed socket command.
#[derive(Debug)]
pub enum ParsedCommand {
    /// Report the current state tag.
    State,
    /// Non-blocking transition: acked as soon as it is admitted.
    Goto { state: String, extra: String },
    /// Blocking transition: acked when its script exits.
    Wait { state: String, extra: String },
    /// Mutate the machine's private spawn environment.
    Set { key: String, value: String },
    /// Trip the machine to its terminal state, non-blocking.
    Die,
}

impl ParsedCommand {
    /// Space-tokenised parse of one socket line. `None` means `KO`.
    pub fn parse(raw: &str) -> Option<Self> {
        let tokens: Vec<&str> = raw.split(' ').filter(|t| !t.is_empty()).collect();
        match tokens.as_slice() {
            ["STATE"] => Some(Self::State),
            ["GOTO", state, extra @ ..] => Some(Self::Goto {
                state: state.to_string(),
                extra: extra.join(" "),
            }),
            ["WAIT", state, extra @ ..] => Some(Self::Wait {
                state: state.to_string(),
                extra: extra.join(" "),
            }),
            ["SET", key, value @ ..] => Some(Self::Set {
                key: key.to_string(),
                value: value.join(" "),
            }),
            ["DIE"] => Some(Self::Die),
            _ => None,
        }
    }
}

/// One command in flight, with the socket's reply slot when there is one.
pub struct MachineCommand {
    pub parsed: ParsedCommand,
    pub reply: Option<oneshot::Sender<String>>,
}

struct Transition {
    state: String,
    extra: String,
    wait: bool,
    tick: Instant,
    reply: Option<oneshot::Sender<String>>,
}

pub struct MachineActor {
    socket: PathBuf,
    states: HashMap<String, StateDef>,
    terminal: String,
    cur: StateDef,
    fifo: VecDeque<Transition>,
    env: HashMap<String, String>,
    running: Option<ShellChild>,
    rx: mpsc::Receiver<MachineCommand>,
    terminate: bool,
}

impl MachineActor {
    pub fn new(manifest: Manifest, socket: PathBuf, rx: mpsc::Receiver<MachineCommand>) -> Self {
        let mut actor = Self {
            socket,
            states: manifest.states,
            terminal: manifest.terminal,
            // The machine boots in 'idle', which may transition to anything.
            cur: StateDef {
                tag: "idle".to_string(),
                shell: String::new(),
                next: vec!["*".to_string()],
            },
            fifo: VecDeque::new(),
            // SET mutates this private copy only; the parent environment is
            // never touched.
            env: std::env::vars().collect(),
            running: None,
            rx,
            terminate: false,
        };
        // Trip the machine into its initial state.
        actor.enqueue(manifest.initial, String::new(), false, None);
        actor
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(TICK);
        loop {
            if self.terminate && self.fifo.is_empty() && self.running.is_none() {
                return;
            }
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(command) => self.handle(command),
                    None => return,
                },
                _ = tick.tick() => self.step().await,
                _ = shutdown.changed(), if !self.terminate => {
                    // Trip to terminal and drain; an in-flight script gets
                    // preempted by the queued transition after the dampener.
                    self.terminate = true;
                    let terminal = self.terminal.clone();
                    self.enqueue(terminal, String::new(), false, None);
                }
            }
        }
    }

    fn handle(&mut self, command: MachineCommand) {
        match command.parsed {
            ParsedCommand::State => ack(command.reply, &self.cur.tag),
            ParsedCommand::Set { key, value } => {
                self.env.insert(key, value);
                ack(command.reply, "OK");
            }
            ParsedCommand::Goto { state, extra } => {
                self.enqueue(state, extra, false, command.reply);
            }
            ParsedCommand::Wait { state, extra } => {
                self.enqueue(state, extra, true, command.reply);
            }
            ParsedCommand::Die => {
                let terminal = self.terminal.clone();
                self.enqueue(terminal, String::new(), false, command.reply);
            }
        }
    }

    fn enqueue(
        &mut self,
        state: String,
        extra: String,
        wait: bool,
        reply: Option<oneshot::Sender<String>>,
    ) {
        self.fifo.push_back(Transition {
            state,
            extra,
            wait,
            tick: Instant::now(),
            reply,
        });
    }

    async fn step(&mut self) {
        if self.running.is_some() {
            self.poll_running().await;
        }
        if self.running.is_none() {
            self.admit();
        }
    }

    /// Checks on the in-flight script and preempts it when transitions have
    /// been waiting behind it for longer than the dampener.
    async fn poll_running(&mut self) {
        let child = self.running.as_mut().expect("a script is running");
        let mut complete = child.poll();

        if !complete
            && self.fifo.len() >= 2
            && self.fifo[1].tick.elapsed() > PREEMPTION_DAMPENER
        {
            debug!(
                "machine : killing pid {} (fifo -> #{} items)",
                child.pid(),
                self.fifo.len()
            );
            child.kill_group();
            complete = true;
        }

        if complete {
            let child = self.running.take().expect("a script is running");
            let pid = child.pid();
            let output = child.wait_drain().await;
            debug!(
                "machine : script took {:.1} s (pid {}, exit {})",
                output.lapse.as_secs_f64(),
                pid,
                output.code.map_or_else(|| "_".to_string(), |c| c.to_string()),
            );
            if !output.stdout.is_empty() {
                debug!("machine : pid {} -> \n  . {}", pid, output.stdout.join("\n  . "));
            }
            if let Some(head) = self.fifo.pop_front() {
                if head.wait {
                    ack(head.reply, "OK");
                }
            }
        }
    }

    /// Walks the FIFO until a transition is admitted and its script spawned,
    /// rejecting everything that fails admission along the way.
    fn admit(&mut self) {
        while self.running.is_none() {
            let Some(head) = self.fifo.front() else {
                return;
            };
            let target = head.state.clone();

            if !self.states.contains_key(&target) {
                warn!("machine : unknown state \"{}\"", target);
                self.reject();
                continue;
            }

            // The terminal state is absorbing: once there, only the no-op
            // terminal -> terminal transition is admitted.
            if self.cur.tag == self.terminal {
                if target == self.terminal {
                    let head = self.fifo.pop_front().expect("peeked above");
                    ack(head.reply, "OK");
                } else {
                    warn!(
                        "machine : {} -> {} is not allowed, skipping",
                        self.cur.tag, target
                    );
                    self.reject();
                }
                continue;
            }

            let allowed = self
                .cur
                .next
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(self.terminal.as_str()));
            if !glob_match(allowed, &target) {
                warn!(
                    "machine : {} -> {} is not allowed, skipping",
                    self.cur.tag, target
                );
                self.reject();
                continue;
            }

            info!("machine : {} -> {}", self.cur.tag, target);
            self.cur = self.states[&target].clone();

            let head = self.fifo.front_mut().expect("peeked above");
            let mut env = self.env.clone();
            env.insert(
                "SOCKET".to_string(),
                self.socket.display().to_string(),
            );
            env.insert("INPUT".to_string(), head.extra.clone());

            match process::spawn_shell_with_env(&self.cur.shell, &env) {
                Ok(child) => {
                    debug!("machine : invoking script (pid {})", child.pid());
                    if !head.wait {
                        ack(head.reply.take(), "OK");
                    }
                    self.running = Some(child);
                }
                Err(e) => {
                    warn!("machine : unable to spawn \"{}\" -> {}", self.cur.shell, e);
                    self.reject();
                }
            }
        }
    }

    /// Pops the head request and signals the failure.
    fn reject(&mut self) {
        if let Some(head) = self.fifo.pop_front() {
            ack(head.reply, "KO");
        }
    }
}

fn ack(reply: Option<oneshot::Sender<String>>, code: &str) {
    if let Some(reply) = reply {
        let _ = reply.send(code.to_string());
    }
}

/// Glob admission: `*` and `?` wildcards, as in the manifest patterns.
fn glob_match<'a>(mut patterns: impl Iterator<Item = &'a str>, target: &str) -> bool {
    patterns.any(|pattern| wildmatch::WildMatch::new(pattern).matches(target))
}
