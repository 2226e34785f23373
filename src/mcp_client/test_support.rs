//! Scripted stub MCP servers for tests.
//!
//! Each stub is a POSIX `sh` loop that reads one JSON-RPC request per line,
//! pulls the numeric id out with `sed`, and answers by method name.

use crate::mcp_client::types::ServerConfig;

/// Canned behaviour for a stub server. `None` for a list method answers
/// with a JSON-RPC error; `None` for `call` never answers.
pub struct StubServer {
    pub announce_ready: bool,
    pub init_error: bool,
    pub noise_before_init: bool,
    /// Exit instead of answering `tools/list`.
    pub exit_on_tools_list: bool,
    /// Shell run before the `tools/call` reply; `$id` holds the request id.
    pub call_preamble: &'static str,
    pub tools: Option<&'static str>,
    pub resources: Option<&'static str>,
    pub call: Option<&'static str>,
    pub read: Option<&'static str>,
}

impl Default for StubServer {
    fn default() -> Self {
        Self {
            announce_ready: true,
            init_error: false,
            noise_before_init: false,
            exit_on_tools_list: false,
            call_preamble: "",
            tools: Some(
                r#"{"tools":[{"name":"read_query","description":"Run a SELECT","inputSchema":{"type":"object"}},{"name":"list_tables","inputSchema":{"type":"object"}}]}"#,
            ),
            resources: Some(r#"{"resources":[{"uri":"schema://bookings","name":"bookings"}]}"#),
            call: Some(r#"{"content":[{"type":"text","text":"42"}]}"#),
            read: Some(r#"{"contents":[{"uri":"schema://bookings","text":"id INTEGER"}]}"#),
        }
    }
}

fn reply(result: Option<&str>) -> String {
    match result {
        Some(body) => format!(
            r#"printf '{{"jsonrpc":"2.0","id":%s,"result":{body}}}\n' "$id""#
        ),
        None => r#"printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32601,"message":"Method not found"}}\n' "$id""#
            .to_string(),
    }
}

impl StubServer {
    /// The shell script implementing this stub.
    pub fn script(&self) -> String {
        let mut script = String::new();
        if self.announce_ready {
            script.push_str("echo 'stub: Server running on stdio' >&2\n");
        }
        let init = if self.init_error {
            r#"printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32602,"message":"unsupported protocol version"}}\n' "$id""#
                .to_string()
        } else {
            let mut init = String::new();
            if self.noise_before_init {
                init.push_str("echo '[INFO] opening database'; echo 'this is not json'; ");
            }
            init.push_str(&reply(Some(
                r#"{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.0.1"}}"#,
            )));
            init
        };
        let call = match self.call {
            Some(body) => format!("{}{}", self.call_preamble, reply(Some(body))),
            None => format!("{}:", self.call_preamble),
        };
        let tools = if self.exit_on_tools_list {
            "exit 0".to_string()
        } else {
            reply(self.tools)
        };

        script.push_str(&format!(
            r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*) {init} ;;
    *'"method":"tools/list"'*) {tools} ;;
    *'"method":"resources/list"'*) {resources} ;;
    *'"method":"tools/call"'*) {call} ;;
    *'"method":"resources/read"'*) {read} ;;
  esac
done
"#,
            resources = reply(self.resources),
            read = reply(self.read),
        ));
        script
    }

    /// A `ServerConfig` running this stub under `sh -c`, with short windows.
    pub fn config(&self) -> ServerConfig {
        let script = self.script();
        let mut config = ServerConfig::new("sh", &["-c", script.as_str()]);
        config.startup_timeout_ms = 5_000;
        config.request_timeout_ms = 5_000;
        config
    }
}
