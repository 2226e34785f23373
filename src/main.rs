use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;

use querybridge::config;
use querybridge::mcp_client::{content, McpClient};

#[derive(Parser)]
#[command(name = "querybridge", version, about = "Query MCP tool servers over stdio")]
struct Cli {
    /// Servers config file (JSON or YAML).
    #[arg(long, global = true, env = config::CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Directory for querybridge.log.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the tools servers advertised at connect time.
    Tools {
        #[arg(long)]
        server: Option<String>,
    },
    /// List the resources servers advertised at connect time.
    Resources {
        #[arg(long)]
        server: Option<String>,
    },
    /// Call a tool by bare or `server.tool` name.
    Call {
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Read a resource from one server.
    Read { server: String, uri: String },
}

impl Command {
    /// The single server this command needs, if it is scoped to one.
    fn target_server(&self) -> Option<&str> {
        match self {
            Command::Tools { server } | Command::Resources { server } => server.as_deref(),
            Command::Read { server, .. } => Some(server),
            Command::Call { .. } => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_path = querybridge::init_tracing(cli.log_dir.as_deref(), cli.verbose)
        .context("failed to initialise logging")?;

    let config_path = match cli.config {
        Some(path) => path,
        None => config::find_config_path(&std::env::current_dir()?)?,
    };
    let servers = config::load_config(&config_path)?;

    let mut client = McpClient::new(servers);
    match cli.command.target_server() {
        Some(name) => client
            .start_server(name)
            .await
            .with_context(|| format!("server '{name}' failed to start (see {})", log_path.display()))?,
        None => {
            for (name, err) in client.start_all().await {
                tracing::warn!(server = %name, error = %err, "server unavailable");
                eprintln!("warning: server '{name}' unavailable: {err}");
            }
        }
    }

    let outcome = run(&client, &cli.command).await;
    client.shutdown_all().await;
    outcome
}

async fn run(client: &McpClient, command: &Command) -> anyhow::Result<()> {
    match command {
        Command::Tools { server } => {
            let tools: Vec<_> = client
                .registry
                .all_tools()
                .iter()
                .filter(|t| server.as_deref().map_or(true, |s| t.server == s))
                .map(|t| {
                    json!({
                        "name": t.qualified_name(),
                        "description": t.tool.description,
                        "inputSchema": t.tool.input_schema,
                    })
                })
                .collect();
            print_json(&tools)?;
        }
        Command::Resources { server } => {
            let mut resources = Vec::new();
            for name in client.running_servers() {
                if server.as_deref().is_some_and(|s| s != name) {
                    continue;
                }
                let conn = client.connection(&name)?;
                for resource in conn.resources() {
                    resources.push(json!({ "server": name, "resource": resource }));
                }
            }
            print_json(&resources)?;
        }
        Command::Call { tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(args).context("--args must be valid JSON")?;
            let result = client.call_tool(tool, arguments).await?;
            print_json(&result)?;

            if let Some(ref value) = result.result {
                for url in content::extract_chart_urls(value) {
                    println!("chart: {url}");
                }
            }
            if !result.success {
                anyhow::bail!(
                    "tool '{}' failed: {}",
                    result.tool_name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
        Command::Read { server, uri } => {
            let value = client.read_resource(server, uri).await?;
            print_json(&value)?;
        }
    }
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
