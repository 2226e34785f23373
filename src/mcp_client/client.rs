//! MCP Client: high-level interface over several named servers.
//!
//! Connects every configured server (a database-query server and a chart
//! server, typically), aggregates their tool catalogs, and routes tool calls
//! to the owning server.

use std::collections::HashMap;
use std::time::Instant;

use super::connection::McpConnection;
use super::content;
use super::errors::McpError;
use super::registry::ToolRegistry;
use super::types::{McpServersConfig, ServerConfig, ToolCallResult};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// Multi-server MCP client.
pub struct McpClient {
    /// Connected servers.
    servers: HashMap<String, McpConnection>,
    /// Server configurations (for restarts).
    configs: HashMap<String, ServerConfig>,
    /// Aggregated tool catalog of all connected servers.
    pub registry: ToolRegistry,
}

impl McpClient {
    /// Create a client from a servers configuration. Nothing is started yet.
    pub fn new(config: McpServersConfig) -> Self {
        Self {
            servers: HashMap::new(),
            configs: config.servers,
            registry: ToolRegistry::new(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every configured server concurrently and build the registry.
    ///
    /// Returns the servers that failed to start (partial startup is OK).
    pub async fn start_all(&mut self) -> Vec<(String, McpError)> {
        let pending = self
            .configs
            .iter()
            .filter(|(name, _)| !self.servers.contains_key(*name))
            .map(|(name, config)| {
                let mut conn = McpConnection::new(name, config.clone());
                async move {
                    let result = conn.connect().await;
                    (conn, result)
                }
            });

        let outcomes = futures::future::join_all(pending).await;

        let mut errors = Vec::new();
        for (conn, result) in outcomes {
            let name = conn.name().to_string();
            match result {
                Ok(_) => {
                    self.registry.register_server_tools(&name, conn.tools());
                    self.servers.insert(name, conn);
                }
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "MCP server failed to start");
                    errors.push((name, e));
                }
            }
        }

        tracing::info!(
            running = self.servers.len(),
            failed = errors.len(),
            tools = self.registry.len(),
            "MCP servers started"
        );
        errors
    }

    /// Start (or restart) a specific server by name.
    pub async fn start_server(&mut self, name: &str) -> Result<(), McpError> {
        let config = self.configs.get(name).cloned().ok_or(McpError::ConfigError {
            reason: format!("no configuration for server '{name}'"),
        })?;

        self.shutdown_server(name).await;

        let mut conn = McpConnection::new(name, config);
        conn.connect().await?;

        self.registry.register_server_tools(name, conn.tools());
        self.servers.insert(name.to_string(), conn);
        Ok(())
    }

    /// Shut down a specific server.
    pub async fn shutdown_server(&mut self, name: &str) {
        if let Some(mut conn) = self.servers.remove(name) {
            conn.disconnect().await;
        }
        self.registry.unregister_server(name);
    }

    /// Shut down all servers.
    pub async fn shutdown_all(&mut self) {
        for (_, conn) in self.servers.iter_mut() {
            conn.disconnect().await;
        }
        self.servers.clear();
        self.registry = ToolRegistry::new();
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Call a tool by bare or qualified name on the server that owns it.
    ///
    /// Remote failures (a JSON-RPC error or an `isError` result) come back
    /// as `success: false`; channel failures are returned as `Err`.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let start = Instant::now();

        let registered = self.registry.resolve(tool_name)?;
        let server_name = registered.server.clone();
        let conn = self.connection(&server_name)?;

        let outcome = conn.call_tool(&registered.tool.name, arguments).await;
        let execution_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) if content::is_error_result(&result) => Ok(ToolCallResult {
                tool_name: registered.tool.name.clone(),
                server: server_name,
                success: false,
                error: Some(content::text_blocks(&result).join("\n")),
                result: Some(result),
                execution_time_ms,
            }),
            Ok(result) => Ok(ToolCallResult {
                tool_name: registered.tool.name.clone(),
                server: server_name,
                success: true,
                result: Some(result),
                error: None,
                execution_time_ms,
            }),
            Err(McpError::RemoteError { code, message, .. }) => Ok(ToolCallResult {
                tool_name: registered.tool.name.clone(),
                server: server_name,
                success: false,
                result: None,
                error: Some(format!("[{code}] {message}")),
                execution_time_ms,
            }),
            Err(e) => Err(e),
        }
    }

    /// Read a resource from a named server.
    pub async fn read_resource(
        &self,
        server: &str,
        uri: &str,
    ) -> Result<serde_json::Value, McpError> {
        self.connection(server)?.read_resource(uri).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// A started server's connection.
    pub fn connection(&self, name: &str) -> Result<&McpConnection, McpError> {
        self.servers.get(name).ok_or(McpError::UnknownServer {
            name: name.to_string(),
        })
    }

    /// Get the number of started servers.
    pub fn running_server_count(&self) -> usize {
        self.servers.len()
    }

    /// Get the number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.registry.len()
    }

    /// Check if a specific server is started and still connected.
    pub fn is_server_running(&self, name: &str) -> bool {
        self.servers.get(name).is_some_and(McpConnection::is_connected)
    }

    /// Get a sorted list of started server names.
    pub fn running_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get names of all configured servers (including those that failed to start).
    pub fn configured_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_config() -> McpServersConfig {
        McpServersConfig {
            servers: HashMap::new(),
        }
    }

    #[test]
    fn test_new_client_empty() {
        let client = McpClient::new(empty_config());
        assert_eq!(client.running_server_count(), 0);
        assert_eq!(client.tool_count(), 0);
        assert!(client.registry.is_empty());
    }

    #[test]
    fn test_configured_servers_sorted() {
        let mut servers = HashMap::new();
        servers.insert("zeta".to_string(), ServerConfig::new("npx", &[]));
        servers.insert("alpha".to_string(), ServerConfig::new("npx", &[]));
        let client = McpClient::new(McpServersConfig { servers });
        assert_eq!(client.configured_servers(), vec!["alpha", "zeta"]);
        assert!(!client.is_server_running("alpha"));
    }

    #[tokio::test]
    async fn test_unknown_server_and_tool() {
        let client = McpClient::new(empty_config());
        assert!(matches!(
            client.read_resource("db", "schema://x").await,
            Err(McpError::UnknownServer { .. })
        ));
        assert!(matches!(
            client.call_tool("read_query", serde_json::json!({})).await,
            Err(McpError::UnknownTool { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_server_without_config() {
        let mut client = McpClient::new(empty_config());
        assert!(matches!(
            client.start_server("db").await,
            Err(McpError::ConfigError { .. })
        ));
    }

    #[cfg(unix)]
    mod end_to_end {
        use super::*;
        use crate::mcp_client::test_support::StubServer;

        fn two_servers() -> McpServersConfig {
            let chart = StubServer {
                tools: Some(
                    r#"{"tools":[{"name":"generate_bar_chart","inputSchema":{"type":"object"}}]}"#,
                ),
                call: Some(
                    r#"{"content":[{"type":"text","text":"https://charts.example.com/c/abc.png"}]}"#,
                ),
                ..StubServer::default()
            };
            let mut servers = HashMap::new();
            servers.insert("db".to_string(), StubServer::default().config());
            servers.insert("chart".to_string(), chart.config());
            servers.insert(
                "broken".to_string(),
                ServerConfig::new("/no/such/mcp-server", &[]),
            );
            McpServersConfig { servers }
        }

        #[tokio::test]
        async fn test_start_all_partial_and_route() {
            let mut client = McpClient::new(two_servers());
            let errors = client.start_all().await;

            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].0, "broken");
            assert_eq!(client.running_servers(), vec!["chart", "db"]);
            assert_eq!(client.tool_count(), 3);

            let db = client
                .call_tool("read_query", serde_json::json!({"query": "SELECT 1"}))
                .await
                .unwrap();
            assert!(db.success);
            assert_eq!(db.server, "db");

            let chart = client
                .call_tool("chart.generate_bar_chart", serde_json::json!({"data": []}))
                .await
                .unwrap();
            assert_eq!(chart.server, "chart");
            assert_eq!(
                content::extract_chart_urls(chart.result.as_ref().unwrap()),
                vec!["https://charts.example.com/c/abc.png"]
            );

            client.shutdown_all().await;
            assert_eq!(client.running_server_count(), 0);
            assert!(client.registry.is_empty());
        }

        #[tokio::test]
        async fn test_restart_single_server() {
            let mut client = McpClient::new(two_servers());
            client.start_all().await;
            client.start_server("db").await.unwrap();
            assert!(client.is_server_running("db"));
            assert_eq!(client.registry.tools_for_server("db").count(), 2);

            client.shutdown_server("db").await;
            assert!(!client.is_server_running("db"));
            assert!(client.call_tool("read_query", serde_json::json!({})).await.is_err());
            client.shutdown_all().await;
        }
    }
}
