//! Connection lifecycle: state tracking and lifecycle notifications.
//!
//! Each connection owns one [`Lifecycle`]. The transport's background tasks
//! and the connection's own methods move it between [`ConnectionState`]s and
//! broadcast [`LifecycleEvent`]s to anyone who subscribed.

use std::sync::RwLock;

use serde::Serialize;
use tokio::sync::broadcast;

use super::types::ConnectionState;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 32;

// ─── Events ──────────────────────────────────────────────────────────────────

/// Notification emitted when a connection changes in a way callers care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Connected {
        server: String,
    },
    /// The server process is gone. `code` is the exit code for a normal exit,
    /// `signal` the terminating signal on unix.
    Disconnected {
        server: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Error {
        server: String,
        message: String,
    },
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

/// State cell plus event channel for one connection.
pub struct Lifecycle {
    server_name: String,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl Lifecycle {
    pub fn new(server_name: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            server_name: server_name.to_string(),
            state: RwLock::new(ConnectionState::Disconnected),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Move to `next`, returning the previous state.
    pub fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        let previous = *guard;
        *guard = next;
        if previous != next {
            tracing::debug!(
                server = %self.server_name,
                from = ?previous,
                to = ?next,
                "connection state changed"
            );
        }
        previous
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to future lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Move `from → to` only if the state is still `from`.
    pub fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *guard != from {
            return false;
        }
        *guard = to;
        tracing::debug!(
            server = %self.server_name,
            from = ?from,
            to = ?to,
            "connection state changed"
        );
        true
    }

    /// Mark a freshly initialized connection usable and announce it.
    ///
    /// Returns `false`, announcing nothing, when the state has left
    /// `Initialized` in the meantime (the process exited).
    pub fn connected(&self) -> bool {
        if !self.transition(ConnectionState::Initialized, ConnectionState::Connected) {
            return false;
        }
        tracing::info!(server = %self.server_name, "MCP server connected");
        self.emit(LifecycleEvent::Connected {
            server: self.server_name.clone(),
        });
        true
    }

    /// Mark the connection gone and announce the exit status.
    pub fn disconnected(&self, code: Option<i32>, signal: Option<i32>) {
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(
            server = %self.server_name,
            code = ?code,
            signal = ?signal,
            "MCP server disconnected"
        );
        self.emit(LifecycleEvent::Disconnected {
            server: self.server_name.clone(),
            code,
            signal,
        });
    }

    /// Announce an asynchronous failure not tied to a single call.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(server = %self.server_name, error = %message, "MCP server error");
        self.emit(LifecycleEvent::Error {
            server: self.server_name.clone(),
            message,
        });
    }
}

/// Split an exit status into `(code, signal)`.
pub fn exit_parts(status: &std::process::ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        (status.code(), status.signal())
    }
    #[cfg(not(unix))]
    {
        (status.code(), None)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
