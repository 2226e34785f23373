//! Server configuration loading.
//!
//! Reads `querybridge.json` / `querybridge.yaml` and resolves environment
//! variables. The file lists the MCP servers to launch:
//!
//! ```yaml
//! servers:
//!   db:
//!     command: npx
//!     args: ["-y", "@executeautomation/database-server", "${DB_PATH:-~/data/bookings.db}"]
//!   chart:
//!     command: npx
//!     args: ["-y", "@antv/mcp-server-chart"]
//!     ready_marker: null
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::McpServersConfig;

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "QUERYBRIDGE_CONFIG";

/// File names searched for, in order, in each directory.
const CONFIG_FILE_NAMES: &[&str] = &["querybridge.json", "querybridge.yaml", "querybridge.yml"];

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Uses `QUERYBRIDGE_CONFIG` if set and the file exists, otherwise searches
/// upward from `start`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, McpError> {
    // 1. Check env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(&path);
        if candidate.is_file() {
            return Ok(candidate);
        }
        tracing::warn!(
            var = CONFIG_ENV_VAR,
            path = %path,
            "config path from env does not exist, searching instead"
        );
    }

    // 2. Walk upward from `start`
    let mut dir = start.to_path_buf();
    loop {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        if !dir.pop() {
            break;
        }
    }

    Err(McpError::ConfigError {
        reason: format!("could not find any of {}", CONFIG_FILE_NAMES.join(", ")),
    })
}

/// Load and parse a servers configuration file.
///
/// `${VAR_NAME}` and `${VAR_NAME:-default}` are interpolated before parsing.
/// `.yaml`/`.yml` files are parsed as YAML, everything else as JSON. Relative
/// server `cwd`s are resolved against the file's directory.
pub fn load_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let interpolated = interpolate_env_vars(&raw);

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    );
    let mut config: McpServersConfig = if is_yaml {
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    } else {
        serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse {}: {e}", path.display()),
        })?
    };

    if let Some(base) = path.parent() {
        resolve_relative_cwds(&mut config, base);
    }

    tracing::info!(
        path = %path.display(),
        servers = ?config.servers.keys().collect::<Vec<_>>(),
        "loaded MCP server config"
    );

    Ok(config)
}

/// Make relative per-server working directories absolute.
fn resolve_relative_cwds(config: &mut McpServersConfig, base: &Path) {
    for server in config.servers.values_mut() {
        if let Some(ref cwd) = server.cwd {
            if !Path::new(cwd).is_absolute() {
                server.cwd = Some(base.join(cwd).to_string_lossy().into_owned());
            }
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

fn var_pattern() -> &'static Regex {
    static VAR_RE: OnceLock<Regex> = OnceLock::new();
    VAR_RE.get_or_init(|| {
        Regex::new(r"\$\{([^}:]*)(?::-([^}]*))?\}").expect("variable pattern is valid")
    })
}

/// Substitute `${NAME}` (empty when unset) and `${NAME:-fallback}`. A
/// fallback gets `~` expansion; environment values are used as-is.
fn interpolate_env_vars(input: &str) -> String {
    var_pattern()
        .replace_all(input, |caps: &Captures<'_>| {
            match (std::env::var(&caps[1]), caps.get(2)) {
                (Ok(value), _) => value,
                (Err(_), Some(fallback)) => expand_tilde(fallback.as_str()),
                (Err(_), None) => String::new(),
            }
        })
        .into_owned()
}

fn expand_tilde(path: &str) -> String {
    match (path.strip_prefix('~'), dirs::home_dir()) {
        (Some(rest), Some(home)) => format!("{}{rest}", home.display()),
        _ => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
