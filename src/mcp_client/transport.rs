//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with an MCP server child process:
//! - Writing JSON-RPC requests to stdin, one object per line
//! - A reader task that demultiplexes stdout lines into the correlator
//! - A stderr drain that forwards server logs and detects readiness
//! - An exit watcher that tears the connection down when the process dies

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::correlator::RequestCorrelator;
use super::errors::McpError;
use super::framing::{classify_line, Frame};
use super::lifecycle::{exit_parts, Lifecycle};
use super::types::{
    error_codes, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerConfig,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time allowed for the process to exit after being killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of recent stderr lines kept for error context.
const STDERR_TAIL_LINES: usize = 20;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Server stdin, shared with the stdout reader so it can answer server
/// requests. `None` once shutdown has closed it.
type SharedStdin = Arc<tokio::sync::Mutex<Option<ChildStdin>>>;

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    pid: Option<u32>,
    writer: SharedStdin,
    correlator: Arc<RequestCorrelator>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    exited: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    exit_watcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reader_handle: JoinHandle<()>,
    stderr_handle: JoinHandle<()>,
}

impl StdioTransport {
    /// Spawn the server process and start the background I/O tasks.
    ///
    /// Returns the transport and, when `config.ready_marker` is set, a
    /// receiver that fires once the marker appears on stderr. The receiver
    /// errors if stderr closes first.
    pub fn spawn(
        name: &str,
        config: &ServerConfig,
        correlator: Arc<RequestCorrelator>,
        lifecycle: Arc<Lifecycle>,
    ) -> Result<(Self, Option<oneshot::Receiver<()>>), McpError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);

        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        let stderr = child.stderr.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stderr".into(),
        })?;

        let pid = child.id();
        tracing::info!(
            server = name,
            command = %config.command,
            args = ?config.args,
            pid = ?pid,
            "spawned MCP server"
        );

        let (ready_tx, ready_rx) = match config.ready_marker.clone() {
            Some(marker) => {
                let (tx, rx) = oneshot::channel();
                (Some((marker, tx)), Some(rx))
            }
            None => (None, None),
        };

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let writer: SharedStdin = Arc::new(tokio::sync::Mutex::new(Some(stdin)));

        let reader_handle = tokio::spawn(read_stdout(
            name.to_string(),
            stdout,
            Arc::clone(&writer),
            Arc::clone(&correlator),
            Arc::clone(&lifecycle),
        ));
        let stderr_handle = tokio::spawn(drain_stderr(
            name.to_string(),
            stderr,
            ready_tx,
            Arc::clone(&stderr_tail),
        ));

        let exited = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let exit_watcher = tokio::spawn(watch_exit(
            name.to_string(),
            child,
            kill_rx,
            Arc::clone(&exited),
            Arc::clone(&correlator),
            lifecycle,
        ));

        let transport = Self {
            server_name: name.to_string(),
            pid,
            writer,
            correlator,
            stderr_tail,
            exited,
            kill_tx: Mutex::new(Some(kill_tx)),
            exit_watcher: tokio::sync::Mutex::new(Some(exit_watcher)),
            reader_handle,
            stderr_handle,
        };

        Ok((transport, ready_rx))
    }

    /// OS process id of the server, if it was available at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Resolves with the response's `result`. The pending entry is removed
    /// if the response does not arrive within `timeout`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let id = self.correlator.next_id();
        let req = JsonRpcRequest::new(id, method, params);

        let json = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let rx = self.correlator.register(id, method)?;

        // The exit watcher may already have drained the table.
        if self.exited.load(Ordering::Acquire) {
            self.correlator.cancel(id);
            return Err(McpError::TransportClosed {
                name: self.server_name.clone(),
                reason: "server process exited".into(),
            });
        }

        if let Err(e) = self.write_line(json).await {
            self.correlator.cancel(id);
            return Err(e);
        }

        tracing::debug!(server = %self.server_name, id, method, "request sent");
        self.correlator.wait(id, method, rx, timeout).await
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| {
            McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to serialize notification: {e}"),
            }
        })?;
        self.write_line(json).await
    }

    /// Write one JSON line to stdin. Each line is written and flushed under
    /// the writer lock so concurrent callers never interleave.
    async fn write_line(&self, json: String) -> Result<(), McpError> {
        send_line(&self.writer, json).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotConnected {
                McpError::TransportClosed {
                    name: self.server_name.clone(),
                    reason: "stdin already closed".into(),
                }
            } else {
                McpError::TransportError {
                    server: self.server_name.clone(),
                    reason: format!("failed to write to stdin: {e}"),
                }
            }
        })
    }

    /// Whether the exit watcher has seen the process go away.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Recent stderr output, oldest line first.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Kill the server process and wait for the exit watcher to finish.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        // Closing stdin first lets well-behaved servers exit on EOF.
        self.writer.lock().await.take();

        let kill_tx = self.kill_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(());
        }

        let watcher = self.exit_watcher.lock().await.take();
        if let Some(handle) = watcher {
            if !join_or_abort(handle, SHUTDOWN_TIMEOUT).await {
                // The aborted watcher will never report this exit.
                self.exited.store(true, Ordering::Release);
                tracing::warn!(
                    server = %self.server_name,
                    "server did not exit within shutdown timeout, watcher aborted"
                );
            }
        }

        self.reader_handle.abort();
        self.stderr_handle.abort();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Dropping `kill_tx` tells the exit watcher to kill the process.
        self.reader_handle.abort();
        self.stderr_handle.abort();
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Write `line` plus a newline and flush, under the stdin lock.
///
/// Fails with `NotConnected` once stdin has been closed.
async fn send_line(
    writer: &tokio::sync::Mutex<Option<ChildStdin>>,
    mut line: String,
) -> std::io::Result<()> {
    line.push('\n');
    let mut guard = writer.lock().await;
    let stdin = guard
        .as_mut()
        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected))?;
    stdin.write_all(line.as_bytes()).await?;
    stdin.flush().await
}

/// Read one line as text. Invalid UTF-8 is replaced rather than treated as
/// a read failure. `Ok(None)` at EOF.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Read stdout line by line and route responses to the correlator.
async fn read_stdout(
    server: String,
    stdout: ChildStdout,
    writer: SharedStdin,
    correlator: Arc<RequestCorrelator>,
    lifecycle: Arc<Lifecycle>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();

    loop {
        let line = match next_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(server = %server, "server stdout closed");
                break;
            }
            Err(e) => {
                lifecycle.error(format!("failed to read stdout: {e}"));
                break;
            }
        };

        match classify_line(&line) {
            Frame::Blank => {}
            Frame::Log(text) => {
                tracing::debug!(server = %server, line = text, "server stdout log");
            }
            Frame::Message(msg) if msg.is_server_request() => {
                answer_server_request(&server, &writer, msg).await;
            }
            Frame::Message(msg) if msg.id.is_some() => {
                correlator.dispatch(msg);
            }
            Frame::Message(msg) => {
                tracing::debug!(
                    server = %server,
                    method = ?msg.method,
                    "server notification"
                );
            }
            Frame::Malformed { line, error } => {
                tracing::warn!(
                    server = %server,
                    line,
                    error = %error,
                    "unparseable line on server stdout"
                );
            }
        }
    }
}

/// Reply to a request the server sent us. `ping` gets an empty result,
/// anything else `Method not found`.
async fn answer_server_request(
    server: &str,
    writer: &tokio::sync::Mutex<Option<ChildStdin>>,
    msg: JsonRpcResponse,
) {
    let method = msg.method.unwrap_or_default();
    let reply = if method == "ping" {
        serde_json::json!({"jsonrpc": "2.0", "id": msg.id, "result": {}})
    } else {
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": msg.id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method '{method}' is not supported by this client"),
            },
        })
    };
    tracing::debug!(server = %server, method = %method, "answering server request");

    if let Err(e) = send_line(writer, reply.to_string()).await {
        tracing::debug!(server = %server, error = %e, "could not answer server request");
    }
}

/// Forward stderr to the log, firing `ready` on the first line containing
/// the readiness marker.
async fn drain_stderr(
    server: String,
    stderr: ChildStderr,
    mut ready: Option<(String, oneshot::Sender<()>)>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();

    loop {
        let line = match next_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "stderr read error");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        tracing::debug!(server = %server, line = trimmed, "server stderr");

        {
            let mut tail = tail.lock().unwrap_or_else(|e| e.into_inner());
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(trimmed.to_string());
        }

        if ready.as_ref().is_some_and(|(marker, _)| trimmed.contains(marker.as_str())) {
            if let Some((_, tx)) = ready.take() {
                tracing::debug!(server = %server, "readiness marker seen");
                let _ = tx.send(());
            }
        }
    }
}

/// Await a background task for at most `limit`, aborting it past that.
/// Returns whether it finished on its own.
async fn join_or_abort(mut handle: JoinHandle<()>, limit: Duration) -> bool {
    if tokio::time::timeout(limit, &mut handle).await.is_ok() {
        return true;
    }
    handle.abort();
    let _ = handle.await;
    false
}

/// Own the child process until it exits or a kill is requested, then fail
/// anything still pending and announce the disconnect.
async fn watch_exit(
    server: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exited: Arc<AtomicBool>,
    correlator: Arc<RequestCorrelator>,
    lifecycle: Arc<Lifecycle>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fires on an explicit kill and when the transport is dropped.
        _ = kill_rx => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(server = %server, error = %e, "kill failed (already exited?)");
            }
            child.wait().await
        }
    };

    let (code, signal) = match &status {
        Ok(status) => exit_parts(status),
        Err(e) => {
            lifecycle.error(format!("failed to wait on server process: {e}"));
            (None, None)
        }
    };

    exited.store(true, Ordering::Release);
    let failed = correlator.fail_all("server process exited");
    if failed > 0 {
        tracing::warn!(server = %server, failed, "failed pending requests on exit");
    }

    lifecycle.disconnected(code, signal);
}

/// Format recent stderr as a suffix for error messages (empty if none).
pub fn format_stderr_suffix(lines: &[String]) -> String {
    if lines.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", lines.join(" / "))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
