// src/core/process.rs

//! Subprocess plumbing shared by the callback driver, the script actor and
//! the automaton: shell spawns in a fresh process group, poll-based waits,
//! group-wide SIGTERM and post-exit pipe draining.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::debug;

/// A shell child running in its own process group.
pub struct ShellChild {
    child: Child,
    pid: u32,
    started: Instant,
}

/// Captured output of a finished child. `code` is `None` when the child was
/// terminated by a signal.
pub struct ShellOutput {
    pub code: Option<i32>,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    pub lapse: Duration,
}

fn shell(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(cmd)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    command
}

/// Spawns `cmd` through `sh -c`, inheriting the process environment with
/// `extra` merged on top.
pub fn spawn_shell(cmd: &str, extra: &HashMap<String, String>) -> io::Result<ShellChild> {
    let mut command = shell(cmd);
    command.envs(extra);
    ShellChild::start(command)
}

/// Spawns `cmd` through `sh -c` with exactly `env` as its environment. Used
/// by the automaton, whose env map is private and mutated only via SET.
pub fn spawn_shell_with_env(cmd: &str, env: &HashMap<String, String>) -> io::Result<ShellChild> {
    let mut command = shell(cmd);
    command.env_clear().envs(env);
    ShellChild::start(command)
}

impl ShellChild {
    fn start(mut command: Command) -> io::Result<Self> {
        let child = command.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("child exited before its pid could be read"))?;
        Ok(Self {
            child,
            pid,
            started: Instant::now(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit probe, called once per tick.
    pub fn poll(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// SIGTERMs the whole process group. A plain kill of the direct child
    /// would leave its descendants running.
    pub fn kill_group(&self) {
        debug!("sending SIGTERM to process group {}", self.pid);
        unsafe {
            libc::killpg(self.pid as libc::pid_t, libc::SIGTERM);
        }
    }

    /// Waits for the child to go away, drains both pipes and reaps it.
    /// Pipes are read before the final wait so a chatty child can flush.
    pub async fn wait_drain(mut self) -> ShellOutput {
        let mut stdout = self.child.stdout.take();
        let mut stderr = self.child.stderr.take();
        let mut out = String::new();
        let mut err = String::new();
        tokio::join!(
            async {
                if let Some(pipe) = stdout.as_mut() {
                    let _ = pipe.read_to_string(&mut out).await;
                }
            },
            async {
                if let Some(pipe) = stderr.as_mut() {
                    let _ = pipe.read_to_string(&mut err).await;
                }
            }
        );
        let status = self.child.wait().await.ok();
        ShellOutput {
            code: status.and_then(|s| s.code()),
            stdout: lines(&out),
            stderr: lines(&err),
            lapse: self.started.elapsed(),
        }
    }
}

fn lines(raw: &str) -> Vec<String> {
    raw.lines().map(str::to_string).collect()
}
