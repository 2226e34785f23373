//! MCP client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be started at all.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The process started but never printed its readiness marker.
    #[error("server '{name}' did not signal readiness within {timeout_ms}ms")]
    StartupTimeout {
        name: String,
        timeout_ms: u64,
    },

    /// The `initialize` handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// No response arrived for a request within its window.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout {
        method: String,
        timeout_ms: u64,
    },

    /// The server answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    RemoteError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A call was made while the connection was not usable, or the
    /// connection went away while the call was pending.
    #[error("transport for server '{name}' is closed: {reason}")]
    TransportClosed {
        name: String,
        reason: String,
    },

    /// I/O or serialization failure on the stdio channel.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// No server with this name is configured or running.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// Call arguments were rejected before anything was sent.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// Configuration error (missing file, bad syntax).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this error came from the remote side rather than the channel.
    pub fn is_remote(&self) -> bool {
        matches!(self, McpError::RemoteError { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_timeout_names_method() {
        let err = McpError::RequestTimeout {
            method: "tools/call".into(),
            timeout_ms: 200,
        };
        let msg = err.to_string();
        assert!(msg.contains("tools/call"));
        assert!(msg.contains("200ms"));
    }

    #[test]
    fn test_is_remote() {
        let remote = McpError::RemoteError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        assert!(remote.is_remote());
        let closed = McpError::TransportClosed {
            name: "db".into(),
            reason: "not connected".into(),
        };
        assert!(!closed.is_remote());
    }
}
