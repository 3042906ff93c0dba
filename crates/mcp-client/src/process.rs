//! Child process handle.
//!
//! A [`ProcessHandle`] owns one backend process. A background task owns
//! the `Child` itself and publishes the exit status once it is known, so
//! callers can `wait`, poll `is_alive`, or `stop` without fighting over a
//! `&mut Child`. Signal handling stays inside this module.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use mh_domain::config::McpServerConfig;

use crate::transport::TransportError;

/// How a backend process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when terminated by a signal or never observed.
    pub code: Option<i32>,
    pub success: bool,
}

impl std::fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

/// The stdio pipes captured at spawn time.
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Owned handle to a running backend process.
pub struct ProcessHandle {
    name: String,
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    kill_tx: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHandle {
    /// Spawn the configured command with piped stdio.
    ///
    /// Stderr is drained in the background and re-emitted as debug logs.
    pub fn spawn(name: &str, config: &McpServerConfig) -> Result<(Self, ProcessPipes), TransportError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| broken_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| broken_pipe("stdout"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(name.to_owned(), stderr));
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(reap(name.to_owned(), child, kill_rx, exit_tx));

        tracing::debug!(server = %name, ?pid, command = %config.command, "backend process spawned");

        Ok((
            Self {
                name: name.to_owned(),
                pid,
                exit_rx,
                kill_tx: parking_lot::Mutex::new(Some(kill_tx)),
            },
            ProcessPipes { stdin, stdout },
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// `true` until the exit status has been observed.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// Exit status, if the process has already ended.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let unknown = ProcessExit {
            code: None,
            success: false,
        };
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(status) => (*status).unwrap_or(unknown),
            // The reaper only goes away after publishing.
            Err(_) => self.exit_status().unwrap_or(unknown),
        };
        exit
    }

    /// Ask the process to terminate, wait up to `grace`, then kill it.
    ///
    /// Safe to call repeatedly; returns the exit status.
    pub async fn stop(&self, grace: Duration) -> ProcessExit {
        if let Some(status) = self.exit_status() {
            return status;
        }

        self.terminate();
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(status) => status,
            Err(_) => {
                tracing::warn!(
                    server = %self.name,
                    grace_ms = grace.as_millis() as u64,
                    "backend did not exit within grace period, killing"
                );
                self.kill();
                self.wait().await
            }
        }
    }

    /// Force-kill the process.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(server = %self.name, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {
        // No graceful signal here: closing stdin is the only polite request,
        // the grace period then ends in a kill.
    }
}

/// Own the child until it exits (or is killed) and publish the status.
async fn reap(
    name: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(server = %name, error = %e, "failed to kill backend process");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(s) => ProcessExit {
            code: s.code(),
            success: s.success(),
        },
        Err(e) => {
            tracing::warn!(server = %name, error = %e, "error waiting for backend process");
            ProcessExit {
                code: None,
                success: false,
            }
        }
    };
    tracing::debug!(server = %name, %exit, "backend process exited");
    let _ = exit_tx.send(Some(exit));
}

async fn drain_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(server = %name, stderr = %line, "backend stderr"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(server = %name, error = %e, "stopped reading backend stderr");
                break;
            }
        }
    }
}

fn broken_pipe(which: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {which}"),
    ))
}
