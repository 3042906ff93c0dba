//! MCP transport layer.
//!
//! Each MCP server communicates over a transport. Currently supported:
//! - **Stdio**: spawn a child process, send JSON-RPC over stdin/stdout.
//!
//! The stdio transport multiplexes: any number of requests may be in flight
//! on one pipe. Each request gets a connection-unique wire id, a pending
//! slot is registered under that id, and a single reader task routes every
//! response line to the matching slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::ChildStdin;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use mh_domain::config::McpServerConfig;

use crate::process::{ProcessExit, ProcessHandle};
use crate::protocol::{BackendFrame, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC request and wait for the corresponding response.
    ///
    /// No timeout is applied here; callers wrap the future. Dropping the
    /// future discards the pending slot.
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError>;

    /// Send a JSON-RPC notification (no response expected).
    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError>;

    /// Check if the transport is still alive.
    fn is_alive(&self) -> bool;

    /// Resolves once the transport has closed (backend exited or shut down).
    async fn closed(&self);

    /// Number of requests currently awaiting a response.
    fn in_flight(&self) -> usize;

    /// OS process id, when the transport owns a process.
    fn pid(&self) -> Option<u32>;

    /// Shut down the transport gracefully.
    async fn shutdown(&self, grace: Duration) -> Option<ProcessExit>;
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("transport not supported: {0}")]
    Unsupported(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pending requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Completion slots keyed by wire id.
#[derive(Clone, Default)]
pub(crate) struct PendingMap {
    inner: Arc<parking_lot::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>,
}

impl PendingMap {
    fn register(&self, id: u64) -> (PendingGuard, oneshot::Receiver<JsonRpcResponse>) {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().insert(id, tx);
        (
            PendingGuard {
                map: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Deliver a response to its waiter. Returns `false` for unknown ids.
    pub(crate) fn complete(&self, id: u64, resp: JsonRpcResponse) -> bool {
        match self.inner.lock().remove(&id) {
            // A closed receiver means the caller gave up; still a known id.
            Some(tx) => {
                let _ = tx.send(resp);
                true
            }
            None => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Drop every slot; waiters observe `ProcessExited`.
    pub(crate) fn fail_all(&self) -> usize {
        let mut map = self.inner.lock();
        let n = map.len();
        map.clear();
        n
    }
}

/// Removes the pending slot on drop (response, timeout or cancellation).
struct PendingGuard {
    map: PendingMap,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.map.inner.lock().remove(&self.id);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Maximum number of non-JSON lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Stdio transport: communicates with a child process over stdin/stdout.
///
/// Each JSON-RPC message is a single newline-delimited line. Writes are
/// serialized by the stdin lock; reads happen on one background task.
pub struct StdioTransport {
    server: String,
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    closed: CancellationToken,
    process: ProcessHandle,
}

impl StdioTransport {
    /// Spawn a child process from the given server config and start the reader.
    pub fn spawn(server: &str, config: &McpServerConfig) -> Result<Self, TransportError> {
        let (process, pipes) = ProcessHandle::spawn(server, config)?;

        let pending = PendingMap::default();
        let alive = Arc::new(AtomicBool::new(true));
        let closed = CancellationToken::new();

        tokio::spawn({
            let server = server.to_owned();
            let pending = pending.clone();
            let alive = alive.clone();
            let closed = closed.clone();
            async move {
                let reason = read_loop(&server, BufReader::new(pipes.stdout), &pending).await;
                alive.store(false, Ordering::SeqCst);
                let dropped = pending.fail_all();
                tracing::debug!(server = %server, %reason, dropped, "backend stdout closed");
                closed.cancel();
            }
        });

        Ok(Self {
            server: server.to_owned(),
            stdin: Mutex::new(Some(pipes.stdin)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            closed,
            process,
        })
    }

    /// Get the next unique request ID.
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Write a line of JSON to stdin.
    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::ProcessExited)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_request_id();
        let (_guard, rx) = self.pending.register(id);

        // The reader flips `alive` before clearing the table, so a slot
        // registered after the clear is caught here.
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }

        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;

        tracing::debug!(server = %self.server, id, method, "sending MCP request");
        self.write_line(&json).await?;

        rx.await.map_err(|_| TransportError::ProcessExited)
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notif = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notif)?;
        tracing::debug!(server = %self.server, method, "sending MCP notification");
        self.write_line(&json).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        self.closed.cancelled().await;
    }

    fn in_flight(&self) -> usize {
        self.pending.len()
    }

    fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    async fn shutdown(&self, grace: Duration) -> Option<ProcessExit> {
        self.alive.store(false, Ordering::SeqCst);
        // Closing stdin is the stdio transport's own "please exit".
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(server = %self.server, error = %e, "error closing MCP server stdin");
            }
        }
        let exit = self.process.stop(grace).await;
        self.pending.fail_all();
        self.closed.cancel();
        tracing::debug!(server = %self.server, %exit, "MCP server process stopped");
        Some(exit)
    }
}

/// Route every line from the backend until EOF or a fatal read error.
///
/// Returns a short description of why reading stopped.
pub(crate) async fn read_loop<R>(server: &str, reader: R, pending: &PendingMap) -> String
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut skipped = 0usize;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return "eof".into(),
            Err(e) => return format!("read error: {e}"),
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        // Skip lines that don't look like JSON (stray logging on stdout).
        if !trimmed.starts_with('{') {
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                return "too many non-JSON lines on stdout".into();
            }
            tracing::debug!(server = %server, line = %trimmed, "skipping non-JSON line from MCP server stdout");
            continue;
        }

        match BackendFrame::parse(trimmed) {
            Ok(BackendFrame::Response(resp)) => {
                let shown = resp.id.to_string();
                let delivered = match resp.id.as_u64() {
                    Some(id) => pending.complete(id, resp),
                    None => false,
                };
                if !delivered {
                    tracing::warn!(
                        server = %server,
                        id = %shown,
                        "dropping response with no matching pending request"
                    );
                }
            }
            Ok(BackendFrame::Notification { method, .. }) => {
                tracing::debug!(server = %server, method = %method, "MCP server notification");
            }
            Ok(BackendFrame::Request { id, method }) => {
                tracing::debug!(
                    server = %server,
                    id = %id,
                    method = %method,
                    "ignoring server-initiated request"
                );
            }
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "skipping malformed JSON from MCP server");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
