//! MCP Client: JSON-RPC over stdio transport for MCP tool servers.
//!
//! This module handles:
//! - Spawning MCP server child processes and watching their lifetime
//! - Line-delimited JSON-RPC 2.0 over process stdio, with responses
//!   correlated to requests by id
//! - The `initialize` handshake and tool/resource catalog discovery
//! - Tool calls and resource reads, routed across several servers
//!
//! [`McpConnection`] talks to one server; [`McpClient`] manages a set of
//! them (e.g. a database server and a chart server) behind one registry.

pub mod client;
pub mod connection;
pub mod content;
pub mod correlator;
pub mod errors;
pub mod framing;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use client::McpClient;
pub use connection::McpConnection;
pub use errors::McpError;
pub use lifecycle::LifecycleEvent;
pub use registry::{RegisteredTool, ToolRegistry};
pub use types::{
    CapabilityReport, ConnectionState, McpServersConfig, ResourceDescriptor, ServerConfig,
    ToolCallResult, ToolDescriptor,
};
