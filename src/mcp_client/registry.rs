//! Tool registry: aggregates tool catalogs across connected MCP servers.
//!
//! Provides:
//! - Lookup by bare name (`read_query`) or qualified name (`db.read_query`)
//! - Ambiguity detection when two servers expose the same bare name
//! - Export of the catalog as OpenAI function-calling tool definitions

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// A tool together with the server that owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisteredTool {
    pub server: String,
    pub tool: ToolDescriptor,
}

impl RegisteredTool {
    /// `server.tool`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server, self.tool.name)
    }
}

/// Aggregated tool registry across all MCP servers, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the catalog of one server.
    pub fn register_server_tools(&mut self, server_name: &str, tools: &[ToolDescriptor]) {
        self.unregister_server(server_name);
        self.tools.extend(tools.iter().map(|tool| RegisteredTool {
            server: server_name.to_string(),
            tool: tool.clone(),
        }));
    }

    /// Remove all tools belonging to a server.
    pub fn unregister_server(&mut self, server_name: &str) {
        self.tools.retain(|t| t.server != server_name);
    }

    /// Resolve a bare or qualified tool name to its owner.
    ///
    /// A qualified `server.tool` name always wins. Server and tool names may
    /// themselves contain dots, so every split point is tried. A bare name
    /// must be unique across servers.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredTool, McpError> {
        let qualified = name.match_indices('.').find_map(|(at, _)| {
            let (server, tool) = (&name[..at], &name[at + 1..]);
            self.tools
                .iter()
                .find(|t| t.server == server && t.tool.name == tool)
        });
        if let Some(found) = qualified {
            return Ok(found);
        }

        let mut matches = self.tools.iter().filter(|t| t.tool.name == name);
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found),
            (None, _) => Err(McpError::UnknownTool {
                name: name.to_string(),
            }),
            (Some(first), Some(second)) => {
                let mut candidates = vec![first.qualified_name(), second.qualified_name()];
                candidates.extend(matches.map(RegisteredTool::qualified_name));
                Err(McpError::InvalidArguments {
                    tool: name.to_string(),
                    reason: format!(
                        "tool name is ambiguous, use one of: {}",
                        candidates.join(", ")
                    ),
                })
            }
        }
    }

    /// Get the server name that owns a tool.
    pub fn get_server_for_tool(&self, tool_name: &str) -> Option<&str> {
        self.resolve(tool_name).ok().map(|t| t.server.as_str())
    }

    /// All registered tools, in registration order.
    pub fn all_tools(&self) -> &[RegisteredTool] {
        &self.tools
    }

    /// Tools belonging to one server.
    pub fn tools_for_server<'a>(
        &'a self,
        server_name: &'a str,
    ) -> impl Iterator<Item = &'a RegisteredTool> + 'a {
        self.tools.iter().filter(move |t| t.server == server_name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Return all unique server names, sorted.
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|t| t.server.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Export tools in the OpenAI function-calling format.
    ///
    /// Names are qualified so the model's choice routes back unambiguously.
    /// A missing schema becomes an empty object schema.
    pub fn to_openai_tools(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                let parameters = if t.tool.input_schema.is_object() {
                    t.tool.input_schema.clone()
                } else {
                    serde_json::json!({"type": "object", "properties": {}})
                };
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.qualified_name(),
                        "description": t.tool.description.clone().unwrap_or_default(),
                        "parameters": parameters,
                    }
                })
            })
            .collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
