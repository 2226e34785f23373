pub mod config;
pub mod mcp_client;
pub mod session;

use std::path::{Path, PathBuf};

/// Number of rotated log files kept next to the live one.
const LOG_KEEP: u32 = 3;

/// Per-user data directory (`<platform data dir>/querybridge`), used for logs
/// when no `--log-dir` is given.
pub fn data_dir() -> PathBuf {
    match dirs::data_dir() {
        Some(dir) => dir.join("querybridge"),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".querybridge"),
    }
}

/// Install a file-backed tracing subscriber and return the log file path.
///
/// The previous runs' logs are shifted to `querybridge.log.1` .. `.3` first.
/// `RUST_LOG` overrides the default filter; `verbose` lowers it to debug.
pub fn init_tracing(log_dir: Option<&Path>, verbose: bool) -> std::io::Result<PathBuf> {
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("querybridge.log");
    rotate_log_file(&log_path, LOG_KEEP);
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("querybridge={level},warn")));

    // One unbuffered write per event, so nothing is lost if a server takes
    // the process down. A second init keeps the subscriber already set.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .try_init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "querybridge starting"
    );

    Ok(log_path)
}

/// `querybridge.log` with a numeric suffix appended.
fn numbered_log(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}

/// Shift `base` to `base.1`, `base.1` to `base.2` and so on, dropping
/// whatever sat at `base.{keep}`. Gaps in the chain are fine.
fn rotate_log_file(base: &Path, keep: u32) {
    if keep == 0 {
        return;
    }
    let _ = std::fs::remove_file(numbered_log(base, keep));
    for n in (1..keep).rev() {
        let _ = std::fs::rename(numbered_log(base, n), numbered_log(base, n + 1));
    }
    let _ = std::fs::rename(base, numbered_log(base, 1));
}
