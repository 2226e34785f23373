//! A single MCP server connection.
//!
//! Owns one stdio transport at a time and drives it through
//! `Disconnected → Connecting → Initialized → Connected`:
//! spawn, wait for readiness, `initialize`, then load the tool and resource
//! catalogs. After that the invoker methods (`call_tool`, `read_resource`,
//! `list_tools`, `list_resources`) are plain round trips through the
//! correlator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::correlator::RequestCorrelator;
use super::errors::McpError;
use super::lifecycle::{Lifecycle, LifecycleEvent};
use super::transport::{format_stderr_suffix, StdioTransport};
use super::types::{
    CapabilityReport, ConnectionState, Implementation, InitializeParams, InitializeResult,
    ResourceDescriptor, ResourcesListResult, ServerConfig, ToolDescriptor, ToolsListResult,
};

// ─── McpConnection ───────────────────────────────────────────────────────────

/// Client side of one MCP server process.
pub struct McpConnection {
    name: String,
    config: ServerConfig,
    correlator: Arc<RequestCorrelator>,
    lifecycle: Arc<Lifecycle>,
    transport: Option<StdioTransport>,
    server_info: Option<Implementation>,
    server_capabilities: serde_json::Value,
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
}

impl McpConnection {
    pub fn new(name: &str, config: ServerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            correlator: Arc::new(RequestCorrelator::new(name)),
            lifecycle: Arc::new(Lifecycle::new(name)),
            transport: None,
            server_info: None,
            server_capabilities: serde_json::Value::Null,
            tools: Vec::new(),
            resources: Vec::new(),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Spawn the server, wait for readiness, handshake, and load the catalog.
    ///
    /// Catalog failures do not fail the connect; they are reported in the
    /// returned [`CapabilityReport`].
    pub async fn connect(&mut self) -> Result<CapabilityReport, McpError> {
        let state = self.lifecycle.state();
        if state != ConnectionState::Disconnected {
            return Err(McpError::TransportError {
                server: self.name.clone(),
                reason: format!("connect called while {state:?}"),
            });
        }

        // A previous process may have died on its own; reap its transport.
        if let Some(old) = self.transport.take() {
            old.shutdown().await;
        }

        self.lifecycle.set_state(ConnectionState::Connecting);

        let (transport, ready) = match StdioTransport::spawn(
            &self.name,
            &self.config,
            Arc::clone(&self.correlator),
            Arc::clone(&self.lifecycle),
        ) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.lifecycle.set_state(ConnectionState::Disconnected);
                self.lifecycle.error(e.to_string());
                return Err(e);
            }
        };
        self.transport = Some(transport);

        if let Some(ready) = ready {
            if let Err(e) = self.wait_ready(ready).await {
                return Err(self.abort_connect(e).await);
            }
        }

        if let Err(e) = self.initialize().await {
            return Err(self.abort_connect(e).await);
        }

        let report = self.load_capabilities().await;

        let exited = self.transport.as_ref().map_or(true, StdioTransport::has_exited);
        if exited || !self.lifecycle.connected() {
            let err = McpError::TransportClosed {
                name: self.name.clone(),
                reason: format!(
                    "server process exited during catalog load{}",
                    format_stderr_suffix(&self.stderr_tail())
                ),
            };
            return Err(self.abort_connect(err).await);
        }

        tracing::info!(
            server = %self.name,
            tools = self.tools.len(),
            resources = self.resources.len(),
            degraded = report.is_degraded(),
            "MCP server ready"
        );

        Ok(report)
    }

    /// Wait for the readiness marker on stderr within the startup window.
    async fn wait_ready(
        &self,
        ready: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<(), McpError> {
        let timeout_ms = self.config.startup_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), ready).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(McpError::InitFailed {
                name: self.name.clone(),
                reason: format!(
                    "server closed stderr before signalling readiness{}",
                    format_stderr_suffix(&self.stderr_tail())
                ),
            }),
            Err(_) => Err(McpError::StartupTimeout {
                name: self.name.clone(),
                timeout_ms,
            }),
        }
    }

    /// Tear down a half-built connection and hand back the error.
    async fn abort_connect(&mut self, err: McpError) -> McpError {
        let stderr = self.stderr_tail();
        if !stderr.is_empty() {
            tracing::warn!(
                server = %self.name,
                stderr = %stderr.join(" / "),
                "server stderr captured on failure"
            );
        }
        self.lifecycle.error(err.to_string());
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
        self.lifecycle.set_state(ConnectionState::Disconnected);
        err
    }

    /// Perform the `initialize` handshake and send `notifications/initialized`.
    pub async fn initialize(&mut self) -> Result<InitializeResult, McpError> {
        let transport = self.transport.as_ref().ok_or_else(|| McpError::TransportClosed {
            name: self.name.clone(),
            reason: "no server process".into(),
        })?;

        let params = serde_json::to_value(InitializeParams::default()).map_err(|e| {
            McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to build initialize params: {e}"),
            }
        })?;

        let result = transport
            .request("initialize", Some(params), self.request_timeout())
            .await
            .map_err(|e| match e {
                McpError::RemoteError { message, .. } => McpError::InitFailed {
                    name: self.name.clone(),
                    reason: message,
                },
                other => other,
            })?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                name: self.name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        if let Err(e) = transport.notify("notifications/initialized", None).await {
            tracing::warn!(server = %self.name, error = %e, "failed to send initialized notification");
        }

        self.server_info = init.server_info.clone();
        self.server_capabilities = init.capabilities.clone();
        self.lifecycle.set_state(ConnectionState::Initialized);

        tracing::debug!(
            server = %self.name,
            server_info = ?init.server_info,
            protocol = ?init.protocol_version,
            "initialize handshake complete"
        );

        Ok(init)
    }

    /// Fetch `tools/list` and `resources/list` into the cached catalog.
    ///
    /// Either call may fail; its catalog is left empty and the reason is
    /// recorded in the report.
    pub async fn load_capabilities(&mut self) -> CapabilityReport {
        let mut report = CapabilityReport::default();

        match self.fetch_list::<ToolsListResult>("tools/list").await {
            Ok(list) => report.tools = list.tools,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "failed to load tools");
                report.tools_error = Some(e.to_string());
            }
        }

        match self.fetch_list::<ResourcesListResult>("resources/list").await {
            Ok(list) => report.resources = list.resources,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "failed to load resources");
                report.resources_error = Some(e.to_string());
            }
        }

        self.tools = report.tools.clone();
        self.resources = report.resources.clone();
        report
    }

    async fn fetch_list<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
    ) -> Result<T, McpError> {
        let transport = self.transport.as_ref().ok_or_else(|| McpError::TransportClosed {
            name: self.name.clone(),
            reason: "no server process".into(),
        })?;
        let result = transport.request(method, None, self.request_timeout()).await?;
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            server: self.name.clone(),
            reason: format!("malformed {method} result: {e}"),
        })
    }

    /// Kill the server process and drop to `Disconnected`. Idempotent.
    pub async fn disconnect(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }
        let failed = self.correlator.fail_all("disconnected");
        if failed > 0 {
            tracing::debug!(server = %self.name, failed, "failed pending requests on disconnect");
        }
        self.lifecycle.set_state(ConnectionState::Disconnected);
    }

    /// Disconnect and connect again; the only way to refresh the catalog.
    pub async fn reconnect(&mut self) -> Result<CapabilityReport, McpError> {
        self.disconnect().await;
        self.connect().await
    }

    // ─── Invoker ─────────────────────────────────────────────────────────

    /// The transport, provided the connection is fully established.
    fn connected_transport(&self) -> Result<&StdioTransport, McpError> {
        let state = self.lifecycle.state();
        match (&self.transport, state) {
            (Some(transport), ConnectionState::Connected) => Ok(transport),
            _ => Err(McpError::TransportClosed {
                name: self.name.clone(),
                reason: format!("connection is {state:?}"),
            }),
        }
    }

    /// Send an arbitrary request and return its raw `result`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.connected_transport()?
            .request(method, params, self.request_timeout())
            .await
    }

    /// Invoke a tool. The result payload is returned verbatim.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        if name.trim().is_empty() {
            return Err(McpError::InvalidArguments {
                tool: "tools/call".into(),
                reason: "tool name must not be empty".into(),
            });
        }
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.request("tools/call", Some(params)).await
    }

    /// Read a resource by URI. The result payload is returned verbatim.
    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpError> {
        if uri.trim().is_empty() {
            return Err(McpError::InvalidArguments {
                tool: "resources/read".into(),
                reason: "resource uri must not be empty".into(),
            });
        }
        self.request("resources/read", Some(serde_json::json!({ "uri": uri })))
            .await
    }

    /// Live `tools/list`; does not touch the cached catalog.
    pub async fn list_tools(&self) -> Result<serde_json::Value, McpError> {
        self.request("tools/list", None).await
    }

    /// Live `resources/list`; does not touch the cached catalog.
    pub async fn list_resources(&self) -> Result<serde_json::Value, McpError> {
        self.request("resources/list", None).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.lifecycle.is_connected()
    }

    /// Tools discovered at connect time, in server order.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    /// Resources discovered at connect time, in server order.
    pub fn resources(&self) -> &[ResourceDescriptor] {
        &self.resources
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    pub fn server_capabilities(&self) -> &serde_json::Value {
        &self.server_capabilities
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle.subscribe()
    }

    pub fn pending_requests(&self) -> usize {
        self.correlator.pending_count()
    }

    fn stderr_tail(&self) -> Vec<String> {
        self.transport
            .as_ref()
            .map(StdioTransport::stderr_tail)
            .unwrap_or_default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::mcp_client::test_support::StubServer;

    async fn connected(stub: StubServer) -> McpConnection {
        let mut conn = McpConnection::new("db", stub.config());
        conn.connect().await.expect("connect");
        conn
    }

    #[tokio::test]
    async fn test_connect_handshake_and_catalog() {
        let conn = connected(StubServer::default()).await;

        assert!(conn.is_connected());
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.server_info().unwrap().name, "stub");

        let names: Vec<&str> = conn.tools().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["read_query", "list_tables"]);
        assert_eq!(conn.resources()[0].uri, "schema://bookings");
    }

    #[tokio::test]
    async fn test_call_tool_returns_result_verbatim() {
        let conn = connected(StubServer::default()).await;
        let result = conn
            .call_tool("read_query", serde_json::json!({"query": "SELECT 1"}))
            .await
            .unwrap();
        assert_eq!(
            result,
            serde_json::json!({"content": [{"type": "text", "text": "42"}]})
        );
    }

    #[tokio::test]
    async fn test_concurrent_calls_resolve_independently() {
        let conn = connected(StubServer::default()).await;
        let (a, b, c) = tokio::join!(
            conn.call_tool("read_query", serde_json::json!({"query": "SELECT 1"})),
            conn.read_resource("schema://bookings"),
            conn.list_tools(),
        );
        assert_eq!(a.unwrap()["content"][0]["text"], "42");
        assert_eq!(b.unwrap()["contents"][0]["text"], "id INTEGER");
        assert_eq!(c.unwrap()["tools"].as_array().unwrap().len(), 2);
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_startup_timeout_without_readiness() {
        let stub = StubServer {
            announce_ready: false,
            ..StubServer::default()
        };
        let mut config = stub.config();
        config.startup_timeout_ms = 200;
        let mut conn = McpConnection::new("silent", config);

        let start = Instant::now();
        let err = conn.connect().await.unwrap_err();
        assert!(
            matches!(err, McpError::StartupTimeout { timeout_ms: 200, .. }),
            "got {err:?}"
        );
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_no_marker_uses_handshake_as_readiness() {
        let stub = StubServer {
            announce_ready: false,
            ..StubServer::default()
        };
        let mut config = stub.config();
        config.ready_marker = None;
        let mut conn = McpConnection::new("db", config);
        conn.connect().await.unwrap();
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_unanswered_call_times_out() {
        let stub = StubServer {
            call: None,
            ..StubServer::default()
        };
        let mut config = stub.config();
        config.request_timeout_ms = 300;
        let mut conn = McpConnection::new("db", config);
        conn.connect().await.unwrap();

        let err = conn
            .call_tool("read_query", serde_json::json!({"query": "SELECT 1"}))
            .await
            .unwrap_err();
        match err {
            McpError::RequestTimeout { method, timeout_ms } => {
                assert_eq!(method, "tools/call");
                assert_eq!(timeout_ms, 300);
            }
            other => panic!("expected RequestTimeout, got {other:?}"),
        }
        assert_eq!(conn.pending_requests(), 0);
        // The connection stays usable after a timeout.
        assert!(conn.list_tools().await.is_ok());
    }

    #[tokio::test]
    async fn test_initialize_error_fails_connect() {
        let stub = StubServer {
            init_error: true,
            ..StubServer::default()
        };
        let mut conn = McpConnection::new("db", stub.config());
        match conn.connect().await.unwrap_err() {
            McpError::InitFailed { reason, .. } => {
                assert_eq!(reason, "unsupported protocol version")
            }
            other => panic!("expected InitFailed, got {other:?}"),
        }
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_resource_list_failure_is_not_fatal() {
        let stub = StubServer {
            resources: None,
            ..StubServer::default()
        };
        let mut conn = McpConnection::new("chart", stub.config());
        let report = conn.connect().await.unwrap();

        assert!(conn.is_connected());
        assert!(report.is_degraded());
        assert!(report.tools_error.is_none());
        assert!(report
            .resources_error
            .as_deref()
            .unwrap()
            .contains("Method not found"));
        assert_eq!(conn.tools().len(), 2);
        assert!(conn.resources().is_empty());
    }

    #[tokio::test]
    async fn test_log_and_garbage_lines_are_skipped() {
        let stub = StubServer {
            noise_before_init: true,
            ..StubServer::default()
        };
        let conn = connected(stub).await;
        assert!(conn.is_connected());
        assert!(conn.call_tool("read_query", serde_json::json!({})).await.is_ok());
    }

    #[tokio::test]
    async fn test_non_utf8_line_does_not_stop_reader() {
        let stub = StubServer {
            call_preamble: r"printf '\377\376 garbage\n'; ",
            call: Some(r#"{"ok":true}"#),
            ..StubServer::default()
        };
        let conn = connected(stub).await;

        let result = conn
            .call_tool("read_query", serde_json::json!({"query": "SELECT 1"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        assert!(conn.list_tools().await.is_ok());
    }

    #[tokio::test]
    async fn test_server_ping_sharing_pending_id_is_answered_not_matched() {
        // The stub pings with the id of the pending call and only sends the
        // real result once the ping has been answered.
        let stub = StubServer {
            call_preamble: r#"printf '{"jsonrpc":"2.0","id":%s,"method":"ping"}\n' "$id"; IFS= read -r pong; case "$pong" in *'"result":{}'*) ;; *) continue ;; esac; "#,
            call: Some(r#"{"real":true}"#),
            ..StubServer::default()
        };
        let conn = connected(stub).await;

        let result = conn
            .call_tool("read_query", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"real": true}));
        assert_eq!(conn.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_exit_during_catalog_load_fails_connect() {
        let stub = StubServer {
            exit_on_tools_list: true,
            ..StubServer::default()
        };
        let mut conn = McpConnection::new("db", stub.config());
        let mut events = conn.subscribe();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }), "got {err:?}");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.is_connected());

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, LifecycleEvent::Connected { .. }),
                "dead server announced as connected"
            );
        }

        // Nothing is left half-open, so connecting again is allowed.
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_calls_before_connect_fail_fast() {
        let conn = McpConnection::new("db", StubServer::default().config());
        let start = Instant::now();
        let err = conn
            .call_tool("read_query", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportClosed { .. }));
        assert!(matches!(
            conn.read_resource("schema://x").await.unwrap_err(),
            McpError::TransportClosed { .. }
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_tool_name_rejected() {
        let conn = connected(StubServer::default()).await;
        let err = conn.call_tool("  ", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_disconnect_twice() {
        let mut conn = connected(StubServer::default()).await;
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.call_tool("read_query", serde_json::json!({})).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_noop() {
        let mut conn = McpConnection::new("db", StubServer::default().config());
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_lifecycle_events_and_reconnect() {
        let mut conn = McpConnection::new("db", StubServer::default().config());
        let mut events = conn.subscribe();

        conn.connect().await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Connected { server: "db".into() }
        );

        conn.reconnect().await.unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Disconnected { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Connected { .. }
        ));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = ServerConfig::new("/no/such/mcp-server", &[]);
        let mut conn = McpConnection::new("ghost", config);
        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }
}
